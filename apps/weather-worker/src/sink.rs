use crate::reading::{self, Reading};
use anyhow::{Context, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::fmt;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransientReason {
    Timeout,
    Transport(String),
}

impl fmt::Display for TransientReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientReason::Timeout => f.write_str("request timed out"),
            TransientReason::Transport(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// No response was obtained.
    TransientFailure(TransientReason),
    RejectedByReceiver { status: u16, body: String },
}

/// Something that accepts a reading and reports how the hand-off went.
pub trait DeliverySink {
    fn deliver(&self, reading: &Reading) -> impl Future<Output = DeliveryOutcome> + Send;
}

/// POSTs each reading as JSON to a single endpoint.
#[derive(Clone)]
pub struct HttpSink {
    client: Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build sink HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

impl DeliverySink for HttpSink {
    async fn deliver(&self, reading: &Reading) -> DeliveryOutcome {
        let body = match reading::encode(reading) {
            Ok(body) => body,
            // Not reachable for a decoded reading; still no response obtained.
            Err(err) => return DeliveryOutcome::TransientFailure(TransientReason::Transport(err.to_string())),
        };

        let response = match self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let reason = if err.is_timeout() {
                    TransientReason::Timeout
                } else {
                    TransientReason::Transport(err.to_string())
                };
                tracing::warn!(error=%err, endpoint=%self.endpoint, "sink request failed");
                return DeliveryOutcome::TransientFailure(reason);
            }
        };

        let status = response.status();
        // Reading to the end hands the connection back to the pool.
        let text = match response.text().await {
            Ok(text) => text,
            Err(err) => {
                tracing::debug!(error=%err, status=%status, "failed to read sink response body");
                format!("<unreadable response body: {err}>")
            }
        };

        if status.is_success() {
            DeliveryOutcome::Delivered
        } else {
            tracing::warn!(status = status.as_u16(), reason = %text, "sink rejected reading");
            DeliveryOutcome::RejectedByReceiver {
                status: status.as_u16(),
                body: text,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    fn reading() -> Reading {
        Reading {
            latitude: 10.0,
            longitude: 20.0,
            temperature: 25.5,
            humidity: 60.0,
            is_daylight: 1,
            precipitation: 0.0,
            timestamp: "t1".to_string(),
        }
    }

    async fn serve(router: Router) -> Option<String> {
        let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            // Sandbox environments can block binding attempts.
            Err(_) => return None,
        };
        let addr = listener.local_addr().ok()?;
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        Some(format!("http://{addr}/api/weather/logs"))
    }

    #[tokio::test]
    async fn created_response_is_delivered_and_body_is_json() {
        let received: Arc<Mutex<Vec<serde_json::Value>>> = Arc::default();
        let router = Router::new()
            .route(
                "/api/weather/logs",
                post(
                    |State(received): State<Arc<Mutex<Vec<serde_json::Value>>>>,
                     Json(body): Json<serde_json::Value>| async move {
                        received.lock().unwrap().push(body);
                        (StatusCode::CREATED, "created")
                    },
                ),
            )
            .with_state(received.clone());
        let Some(url) = serve(router).await else { return };

        let sink = HttpSink::new(url, Duration::from_secs(5)).unwrap();
        assert_eq!(sink.deliver(&reading()).await, DeliveryOutcome::Delivered);

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["is_day"], 1);
        assert_eq!(received[0]["temperature"], 25.5);
        assert_eq!(received[0]["timestamp"], "t1");
    }

    #[tokio::test]
    async fn any_2xx_counts_as_delivered() {
        let router = Router::new().route("/api/weather/logs", post(|| async { StatusCode::ACCEPTED }));
        let Some(url) = serve(router).await else { return };
        let sink = HttpSink::new(url, Duration::from_secs(5)).unwrap();
        assert_eq!(sink.deliver(&reading()).await, DeliveryOutcome::Delivered);
    }

    #[tokio::test]
    async fn server_error_is_rejected_with_body() {
        let router = Router::new().route(
            "/api/weather/logs",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "server error") }),
        );
        let Some(url) = serve(router).await else { return };
        let sink = HttpSink::new(url, Duration::from_secs(5)).unwrap();
        assert_eq!(
            sink.deliver(&reading()).await,
            DeliveryOutcome::RejectedByReceiver {
                status: 500,
                body: "server error".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn unknown_route_is_rejected() {
        let router = Router::new().route("/other", post(|| async { StatusCode::OK }));
        let Some(url) = serve(router).await else { return };
        let sink = HttpSink::new(url, Duration::from_secs(5)).unwrap();
        assert!(matches!(
            sink.deliver(&reading()).await,
            DeliveryOutcome::RejectedByReceiver { status: 404, .. }
        ));
    }

    #[tokio::test]
    async fn slow_receiver_times_out_as_transient() {
        let router = Router::new().route(
            "/api/weather/logs",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                StatusCode::CREATED
            }),
        );
        let Some(url) = serve(router).await else { return };
        let sink = HttpSink::new(url, Duration::from_millis(100)).unwrap();
        assert_eq!(
            sink.deliver(&reading()).await,
            DeliveryOutcome::TransientFailure(TransientReason::Timeout)
        );
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        let port = match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => match listener.local_addr() {
                Ok(addr) => addr.port(),
                Err(_) => return,
            },
            Err(_) => return,
        };
        // Listener is dropped; nothing accepts on the port now.
        let sink = HttpSink::new(format!("http://127.0.0.1:{port}/api/weather/logs"), Duration::from_secs(2)).unwrap();
        assert!(matches!(
            sink.deliver(&reading()).await,
            DeliveryOutcome::TransientFailure(TransientReason::Transport(_))
        ));
    }
}
