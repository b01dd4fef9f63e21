//! Store client seam.
//!
//! The population stage and the flush step only need three things from a
//! client library: open a dedicated connection, `SET` a key and `FLUSHALL`.
//! [`StoreConnector`] and [`StoreClient`] capture exactly that, and
//! [`RedisStore`] implements them with the `redis` crate.

use crate::error::{Error, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};

/// Opens dedicated client connections. Every call yields a fresh connection;
/// nothing is pooled or shared.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    type Client: StoreClient;

    async fn connect(&self) -> Result<Self::Client>;
}

#[async_trait]
pub trait StoreClient: Send + 'static {
    async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn flush_all(&mut self) -> Result<()>;

    /// Releases the connection. The handle is dropped right after, whatever
    /// the result.
    async fn close(&mut self) -> Result<()>;
}

/// Redis protocol store reached over TCP, or over TLS without certificate
/// verification when `secure` is set.
#[derive(Debug, Clone)]
pub struct RedisStore {
    info: ConnectionInfo,
    target: String,
}

impl RedisStore {
    pub fn new(host: &str, port: u16, secure: bool) -> Self {
        let addr = if secure {
            ConnectionAddr::TcpTls {
                host: host.to_owned(),
                port,
                insecure: true,
                tls_params: None,
            }
        } else {
            ConnectionAddr::Tcp(host.to_owned(), port)
        };
        Self {
            info: ConnectionInfo {
                addr,
                redis: RedisConnectionInfo::default(),
            },
            target: format!("{host}:{port}"),
        }
    }
}

#[async_trait]
impl StoreConnector for RedisStore {
    type Client = RedisClient;

    async fn connect(&self) -> Result<RedisClient> {
        let client = redis::Client::open(self.info.clone())
            .map_err(|e| Error::connection(&self.target, e))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::connection(&self.target, e))?;
        Ok(RedisClient {
            target: self.target.clone(),
            connection: Some(connection),
        })
    }
}

pub struct RedisClient {
    target: String,
    connection: Option<MultiplexedConnection>,
}

impl RedisClient {
    fn connection(&mut self, key: &str) -> Result<&mut MultiplexedConnection> {
        self.connection
            .as_mut()
            .ok_or_else(|| Error::command(key, format!("connection to {} closed", self.target)))
    }
}

#[async_trait]
impl StoreClient for RedisClient {
    async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        let con = self.connection(key)?;
        let () = con.set(key, value).await.map_err(|e| Error::command(key, e))?;
        Ok(())
    }

    async fn flush_all(&mut self) -> Result<()> {
        let con = self.connection("*")?;
        let () = redis::cmd("FLUSHALL")
            .query_async(con)
            .await
            .map_err(|e| Error::command("*", e))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // The multiplexed driver task ends once its last handle is dropped.
        if self.connection.take().is_none() {
            return Err(Error::close(&self.target, "already closed"));
        }
        tracing::trace!("Closed store connection to {}", self.target);
        Ok(())
    }
}
