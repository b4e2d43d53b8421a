use crate::amqp::configuration::ConnectionSettings;
use crate::transport::Connector;
use anyhow::Context;
use lapin::tcp::{AMQPUriTcpExt, NativeTlsConnector};
use lapin::uri::{AMQPScheme, AMQPUri};
use lapin::ConnectionProperties;
use std::sync::Arc;
use std::time::Duration;

/// Used when `connection_timeout_seconds` is left unspecified.
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens `lapin` connections to the broker described by [`ConnectionSettings`].
#[derive(Clone)]
pub struct ConnectionFactory {
    uri: AMQPUri,
    connection_name: String,
    connection_timeout: Duration,
    /// `None` for plain-text connections.
    tls: Option<Arc<TlsConnector>>,
}

struct TlsConnector {
    connector: NativeTlsConnector,
    /// The domain the server certificate is checked against.
    domain: String,
}

impl ConnectionFactory {
    /// Fails if the TLS settings cannot be turned into a connector (e.g. an invalid CA
    /// certificate chain).
    pub fn new_from_config(settings: &ConnectionSettings) -> Result<Self, anyhow::Error> {
        let tls = match &settings.tls {
            None => None,
            Some(tls) => {
                let mut builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls.ca_certificate_chain()? {
                    builder.add_root_certificate(certificate);
                }
                Some(Arc::new(TlsConnector {
                    connector: builder.build().context("TLS configuration failed")?,
                    domain: tls.domain.clone().unwrap_or_else(|| settings.host.clone()),
                }))
            }
        };
        Ok(Self {
            uri: settings.amqp_uri(),
            connection_name: settings.connection_name.clone(),
            connection_timeout: settings
                .connection_timeout()
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            tls,
        })
    }

    #[tracing::instrument(name = "rabbitmq_connect", skip(self), fields(connection_name = %self.connection_name))]
    async fn open(&self) -> Result<lapin::Connection, anyhow::Error> {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_connection_name(self.connection_name.clone().into());
        let uri = self.uri.clone();
        let tls = self.tls.clone();
        let connecting = async move {
            match tls {
                None => lapin::Connection::connect_uri(uri, properties).await,
                Some(tls) => {
                    // Plain TCP first, then the TLS handshake against the configured domain.
                    let connect = Box::new(move |uri: &AMQPUri| {
                        let mut tcp_uri = uri.clone();
                        tcp_uri.scheme = AMQPScheme::AMQP;
                        tcp_uri
                            .connect()
                            .and_then(|tcp| tcp.into_native_tls(&tls.connector, &tls.domain))
                    });
                    lapin::Connection::connector(uri, connect, properties).await
                }
            }
        };
        tokio::time::timeout(self.connection_timeout, connecting)
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "Timed out after {:?} while connecting to RabbitMQ.",
                    self.connection_timeout
                )
            })?
            .context("Failed to connect to RabbitMQ.")
    }
}

#[async_trait::async_trait]
impl Connector for ConnectionFactory {
    type Connection = lapin::Connection;
    type Channel = lapin::Channel;

    async fn connect(&self) -> Result<lapin::Connection, anyhow::Error> {
        self.open().await
    }
}
