fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

pub mod registers {
    use crate::output::{self, Record};
    use crate::registers::{Kind, Mode, RegisterCatalog, RegisterEntry};

    /// Search and output known bus variables.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        /// Only list variables whose name, description or register address contain this text.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not output the variables")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct RegisterSchema {
        pub address: u8,
        pub name: &'static str,
        pub kind: Kind,
        pub mode: Mode,
        pub minimum: Option<i16>,
        pub maximum: Option<i16>,
        pub description: &'static str,
    }

    impl From<&RegisterEntry> for RegisterSchema {
        fn from(entry: &RegisterEntry) -> Self {
            Self {
                address: entry.address,
                name: entry.name,
                kind: entry.kind,
                mode: entry.mode,
                minimum: entry.minimum,
                maximum: entry.maximum,
                description: entry.description,
            }
        }
    }

    impl RegisterSchema {
        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_lowercase();
            if self.name.contains(&pattern) {
                return true;
            }
            if self.description.to_lowercase().contains(&pattern) {
                return true;
            }
            let pattern = pattern.trim_start_matches("0x");
            !pattern.is_empty() && format!("{:02x}", self.address).contains(pattern)
        }
    }

    impl Record for RegisterSchema {
        const HEADERS: &'static [&'static str] =
            &["Address", "Name", "Kind", "Mode", "Min", "Max", "Description"];

        fn cells(&self) -> Vec<String> {
            vec![
                format!("{:#04x}", self.address),
                self.name.to_string(),
                self.kind.to_string(),
                self.mode.to_string(),
                self.minimum.map(|v| v.to_string()).unwrap_or_default(),
                self.maximum.map(|v| v.to_string()).unwrap_or_default(),
                self.description.to_string(),
            ]
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output().map_err(Error::Output)?;
        for entry in RegisterCatalog::standard().entries() {
            let register = RegisterSchema::from(entry);
            if let Some(pattern) = &args.filter {
                if !register.is_match(pattern) {
                    continue;
                }
            }
            output.record(&register).map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }

}

pub mod read {
    use crate::connection::{self, DeviceClient};
    use crate::guard::OperationGuard;
    use crate::output::{self, Record};
    use crate::snapshot::Field;

    /// Read variables from the ventilation unit.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        /// Variables to read. Every variable and the derived figures are read when none are given.
        variables: Vec<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("reading from the ventilation unit failed")]
        Read(#[source] connection::Error),
        #[error("could not output the values")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct ValueRecord<'a> {
        pub variable: &'a str,
        pub value: Field,
    }

    impl Record for ValueRecord<'_> {
        const HEADERS: &'static [&'static str] = &["Variable", "Value"];

        fn cells(&self) -> Vec<String> {
            vec![self.variable.to_string(), self.value.to_string()]
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = super::runtime().map_err(Error::Runtime)?;
        let mut output = args.output.to_output().map_err(Error::Output)?;
        let guard = OperationGuard::new(*args.connection.deadline);
        let mut client = DeviceClient::new(args.connection);
        if args.variables.is_empty() {
            let snapshot =
                runtime.block_on(guard.read_all_values(&mut client)).map_err(Error::Read)?;
            for (variable, value) in snapshot.fields() {
                output.record(&ValueRecord { variable, value }).map_err(Error::Output)?;
            }
        } else {
            let variables = &args.variables;
            let values = runtime
                .block_on(guard.invoke(&mut client, async |client: &mut DeviceClient| {
                    let mut values = Vec::with_capacity(variables.len());
                    for variable in variables {
                        values.push((variable.as_str(), client.read_value(variable).await?));
                    }
                    Ok(values)
                }))
                .map_err(Error::Read)?;
            for (variable, value) in values {
                let record = ValueRecord { variable, value: Field::Value(value) };
                output.record(&record).map_err(Error::Output)?;
            }
        }
        output.commit().map_err(Error::Output)
    }
}

pub mod write {
    use crate::connection::{self, DeviceClient};
    use crate::guard::OperationGuard;
    use crate::value::{self, Value};

    /// Write a single variable.
    ///
    /// Bit flags are written by reading their register first, so that the other flags sharing it
    /// stay as they are.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        variable: String,
        /// The new value. Flags accept `on`/`off`, `true`/`false` or `1`/`0`.
        value: String,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("invalid value for `{1}`")]
        Parse(#[source] value::Error, String),
        #[error("writing to the ventilation unit failed")]
        Write(#[source] connection::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = super::runtime().map_err(Error::Runtime)?;
        let guard = OperationGuard::new(*args.connection.deadline);
        let mut client = DeviceClient::new(args.connection);
        let entry = client.writable_entry(&args.variable).map_err(Error::Write)?;
        let value = Value::parse(entry.kind, &args.value)
            .map_err(|e| Error::Parse(e, args.variable.clone()))?;
        runtime
            .block_on(guard.write_value(&mut client, &args.variable, value))
            .map_err(Error::Write)?;
        println!("{} = {value}", args.variable);
        Ok(())
    }
}

pub mod sniff {
    use std::io::Write as _;

    use futures::StreamExt as _;
    use tokio_util::codec::FramedRead;

    use crate::connection;
    use crate::registers::RegisterCatalog;
    use crate::telegram::{Frame, Telegram, TelegramCodec, address_name};
    use crate::value;

    /// Passively print the traffic on the bus.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        /// Stop after this many frames.
        #[arg(long)]
        count: Option<u64>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not open the connection")]
        Connect(#[source] connection::Error),
        #[error("could not read from the connection")]
        Receive(#[source] std::io::Error),
        #[error("could not write data to the terminal")]
        WriteStdout(#[source] std::io::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = super::runtime().map_err(Error::Runtime)?;
        runtime.block_on(async {
            let stream =
                connection::open_stream(&args.connection).await.map_err(Error::Connect)?;
            let catalog = RegisterCatalog::standard();
            let mut frames = FramedRead::new(stream, TelegramCodec::default());
            let mut seen = 0;
            while let Some(frame) = frames.next().await {
                let frame = frame.map_err(Error::Receive)?;
                let line = describe(&catalog, jiff::Timestamp::now(), &frame);
                writeln!(std::io::stdout().lock(), "{line}").map_err(Error::WriteStdout)?;
                seen += 1;
                if args.count.is_some_and(|count| seen >= count) {
                    break;
                }
            }
            Ok(())
        })
    }

    /// One line of sniffer output.
    pub fn describe(
        catalog: &RegisterCatalog,
        timestamp: jiff::Timestamp,
        frame: &Frame,
    ) -> String {
        match frame {
            Frame::Jitter(bytes) => {
                let hex = bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ");
                format!("{timestamp} jitter {hex}")
            }
            Frame::Telegram(telegram) => {
                let sender = address_name(telegram.sender);
                let receiver = address_name(telegram.receiver);
                let route = format!("{sender}>{receiver}");
                format!("{timestamp} {telegram} {route} {}", meaning(catalog, telegram))
            }
        }
    }

    fn meaning(catalog: &RegisterCatalog, telegram: &Telegram) -> String {
        if !telegram.has_valid_checksum() {
            return "(bad checksum)".to_string();
        }
        if telegram.is_read_request() {
            let names =
                catalog.entries_for_address(telegram.data).map(|e| e.name).collect::<Vec<_>>();
            if names.is_empty() {
                return format!("request {:#04x}", telegram.data);
            }
            return format!("request {}", names.join(","));
        }
        let values = catalog
            .entries_for_address(telegram.register)
            .map(|entry| match value::decode(entry, telegram.data) {
                Ok(value) => format!("{}={value}", entry.name),
                Err(_) => format!("{}=?", entry.name),
            })
            .collect::<Vec<_>>();
        if values.is_empty() {
            format!("{:#04x}={}", telegram.register, telegram.data)
        } else {
            values.join(" ")
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::telegram::BusAddress;

        fn line(frame: Frame) -> String {
            describe(&RegisterCatalog::standard(), jiff::Timestamp::UNIX_EPOCH, &frame)
        }

        #[test]
        fn telegrams_are_annotated() {
            let status = Telegram::build(BusAddress::Remote1, BusAddress::Mainboard1, 0x29, 3);
            assert_eq!(
                line(Frame::Telegram(status)),
                "1970-01-01T00:00:00Z 01 21 11 29 03 5f FB1>MB1 fanspeed=2"
            );
            let request = Telegram::read_request(0x34);
            assert!(
                line(Frame::Telegram(request))
                    .ends_with("_HA>MB1 request temperature_extract_air")
            );
            let unknown = Telegram::build(BusAddress::Mainboard1, BusAddress::AllRemotes, 0x55, 7);
            assert!(line(Frame::Telegram(unknown)).ends_with("MB1>FB* 0x55=7"));
        }

        #[test]
        fn flags_are_decoded_together() {
            let leds = Telegram::build(BusAddress::Mainboard1, BusAddress::AllRemotes, 0xA3, 0x09);
            let text = line(Frame::Telegram(leds));
            assert!(text.contains("powerstate=on"), "{text}");
            assert!(text.contains("winter_mode=on"), "{text}");
            assert!(text.contains("co2_indicator=off"), "{text}");
        }

        #[test]
        fn noise() {
            assert_eq!(
                line(Frame::Jitter(vec![0xff, 0x00])),
                "1970-01-01T00:00:00Z jitter ff 00"
            );
            let mut corrupt = Telegram::read_request(0x29);
            corrupt.checksum = 0;
            assert!(line(Frame::Telegram(corrupt)).ends_with("(bad checksum)"));
        }
    }
}
