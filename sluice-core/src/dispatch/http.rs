use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::{
    Client,
    header::{CONTENT_TYPE, HeaderMap, HeaderValue},
};
use tracing::{trace, warn};
use url::Url;
use uuid::Uuid;

use super::FunctionInvoker;
use crate::{
    config::InvokerConfig,
    error::{Result, SluiceError},
    types::{DiscoveredObject, FunctionTarget},
};

const JSON: &str = "application/json";

/// Invokes functions by POSTing the object payload to their in-cluster
/// service endpoint.
#[derive(Debug, Clone)]
pub struct HttpFunctionInvoker {
    client: Client,
    config: InvokerConfig,
}

impl HttpFunctionInvoker {
    pub fn new(config: InvokerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self::with_client(config, client))
    }

    /// Use a preconfigured client (custom resolver, proxies, TLS roots).
    pub fn with_client(config: InvokerConfig, client: Client) -> Self {
        Self { client, config }
    }

    /// `{scheme}://{function}.{namespace}.{cluster_domain}:{port}/`
    pub fn endpoint(&self, target: &FunctionTarget) -> Result<Url> {
        let port = target.port.unwrap_or(self.config.default_port);
        let raw = format!(
            "{}://{}.{}.{}:{}/",
            self.config.scheme,
            target.name,
            target.namespace,
            self.config.cluster_domain.trim_matches('.'),
            port
        );
        Url::parse(&raw)
            .map_err(|err| SluiceError::Invocation(format!("invalid endpoint {raw}: {err}")))
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON));
        headers.insert("event-type", HeaderValue::from_static(JSON));
        headers.insert("event-id", header_value(&Uuid::new_v4().to_string())?);
        headers.insert(
            "event-time",
            header_value(&Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))?,
        );
        headers.insert("event-namespace", header_value(&self.config.event_namespace)?);
        Ok(headers)
    }
}

fn header_value(raw: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(raw)
        .map_err(|err| SluiceError::Invocation(format!("invalid header value {raw:?}: {err}")))
}

#[async_trait]
impl FunctionInvoker for HttpFunctionInvoker {
    async fn invoke(
        &self,
        target: &FunctionTarget,
        object: &DiscoveredObject,
    ) -> Result<()> {
        let url = self.endpoint(target)?;
        let response = self
            .client
            .post(url.clone())
            .headers(self.headers()?)
            .json(object)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            trace!(target: "sluice::dispatch", function = %target, %url, %status, "invocation accepted");
        } else {
            // The function ran and answered; delivery is not retried.
            warn!(
                target: "sluice::dispatch",
                function = %target,
                %url,
                %status,
                key = %object.key,
                "function returned a non-success status"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::net::SocketAddr;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    fn target(port: Option<u16>) -> FunctionTarget {
        FunctionTarget {
            namespace: "media".into(),
            name: "resize".into(),
            port,
        }
    }

    fn object() -> DiscoveredObject {
        DiscoveredObject {
            bucket: "uploads".into(),
            key: "photo.jpg".into(),
            modified: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 1).unwrap(),
        }
    }

    /// Accept one connection, capture the raw request, answer with `status`.
    async fn serve_once(listener: TcpListener, status: &'static str) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let read = socket.read(&mut buf).await.unwrap();
            raw.extend_from_slice(&buf[..read]);
            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(split) = text.find("\r\n\r\n") {
                let length = text[..split]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= split + 4 + length {
                    break;
                }
            }
            if read == 0 {
                break;
            }
        }
        let reply = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
        socket.write_all(reply.as_bytes()).await.unwrap();
        String::from_utf8_lossy(&raw).to_string()
    }

    async fn invoker_for(listener: &TcpListener) -> (HttpFunctionInvoker, u16) {
        let addr: SocketAddr = listener.local_addr().unwrap();
        let config = InvokerConfig {
            cluster_domain: "cluster.test".into(),
            ..InvokerConfig::default()
        };
        let client = Client::builder()
            .resolve("resize.media.cluster.test", addr)
            .build()
            .unwrap();
        (HttpFunctionInvoker::with_client(config, client), addr.port())
    }

    #[test]
    fn endpoint_follows_service_dns_layout() {
        let invoker = HttpFunctionInvoker::new(InvokerConfig::default()).unwrap();
        assert_eq!(
            invoker.endpoint(&target(None)).unwrap().as_str(),
            "http://resize.media.svc.cluster.local:8080/"
        );
        assert_eq!(
            invoker.endpoint(&target(Some(9000))).unwrap().as_str(),
            "http://resize.media.svc.cluster.local:9000/"
        );
    }

    #[tokio::test]
    async fn posts_payload_with_event_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (invoker, port) = invoker_for(&listener).await;
        let server = tokio::spawn(serve_once(listener, "200 OK"));

        invoker.invoke(&target(Some(port)), &object()).await.unwrap();
        let request = server.await.unwrap();
        let lower = request.to_ascii_lowercase();

        assert!(request.starts_with("POST / HTTP/1.1"));
        assert!(lower.contains("content-type: application/json"));
        assert!(lower.contains("event-type: application/json"));
        assert!(lower.contains("event-namespace: s3triggers.sluice.dev"));
        assert!(lower.contains("event-id: "));
        assert!(lower.contains("event-time: "));
        assert!(request.contains(r#""bucket":"uploads""#));
        assert!(request.contains(r#""key":"photo.jpg""#));
        assert!(request.contains(r#""modified":"2024-05-01T10:00:01Z""#));
    }

    #[tokio::test]
    async fn error_status_still_counts_as_delivered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (invoker, port) = invoker_for(&listener).await;
        let server = tokio::spawn(serve_once(listener, "500 Internal Server Error"));

        assert!(invoker.invoke(&target(Some(port)), &object()).await.is_ok());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn transport_failure_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (invoker, port) = invoker_for(&listener).await;
        drop(listener);

        let err = invoker.invoke(&target(Some(port)), &object()).await.unwrap_err();
        assert!(matches!(err, SluiceError::Http(_)));
        assert!(err.is_transient());
    }
}
