use tokio::task::JoinHandle;
use tokio_postgres::{Client, Config, NoTls};
use tracing::{debug, error};

use crate::Result;

/// A client plus the task driving its socket. Dropping the connection
/// stops the task, which closes the session.
pub struct PgConnection {
    client: Client,
    connection_task: JoinHandle<()>,
}

impl PgConnection {
    pub async fn connect(config: &Config) -> Result<Self> {
        let (client, connection) = config.connect(NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Connection error: {}", e);
            }
        });

        debug!("Connected to PostgreSQL");

        Ok(Self {
            client,
            connection_task,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut Client {
        &mut self.client
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}
