use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::connection::{DeviceClient, Error};
use crate::snapshot::ValueSnapshot;
use crate::value::Value;

/// There is only one bus, so there is only ever one logical operation on it per process.
static OPERATION_LOCK: LazyLock<Arc<Mutex<()>>> = LazyLock::new(Default::default);

/// Runs connect, operation and disconnect as one unit under a deadline.
///
/// When the deadline passes the in-flight operation is dropped wherever it was waiting, the
/// connection is closed and [`Error::Timeout`] is returned.
#[derive(Clone)]
pub struct OperationGuard {
    lock: Arc<Mutex<()>>,
    deadline: Duration,
}

impl OperationGuard {
    pub fn new(deadline: Duration) -> Self {
        Self::with_lock(Arc::clone(&OPERATION_LOCK), deadline)
    }

    /// Serialize on `lock` instead of the process-wide one.
    pub fn with_lock(lock: Arc<Mutex<()>>, deadline: Duration) -> Self {
        Self { lock, deadline }
    }

    pub async fn invoke<R>(
        &self,
        client: &mut DeviceClient,
        operation: impl AsyncFnOnce(&mut DeviceClient) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let _held = self.lock.lock().await;
        debug!(message = "acquired the operation lock", deadline = ?self.deadline);
        let outcome = tokio::time::timeout(self.deadline, async {
            client.connect().await?;
            let result = operation(&mut *client).await;
            client.disconnect().await;
            result
        })
        .await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    message = "operation timed out, closing the connection",
                    deadline = ?self.deadline
                );
                client.disconnect().await;
                Err(Error::Timeout(self.deadline))
            }
        }
    }

    pub async fn read_value(&self, client: &mut DeviceClient, name: &str) -> Result<Value, Error> {
        self.invoke(client, async |client: &mut DeviceClient| client.read_value(name).await)
            .await
    }

    pub async fn read_all_values(&self, client: &mut DeviceClient) -> Result<ValueSnapshot, Error> {
        self.invoke(client, async |client: &mut DeviceClient| client.read_all_values().await)
            .await
    }

    /// Invalid writes are rejected before a connection is even attempted.
    pub async fn write_value(
        &self,
        client: &mut DeviceClient,
        name: &str,
        value: Value,
    ) -> Result<(), Error> {
        client.writable_entry(name)?;
        self.invoke(client, async |client: &mut DeviceClient| {
            client.write_value(name, value).await
        })
        .await
    }
}
