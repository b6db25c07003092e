use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use pixel_tracker::config::Config;
use pixel_tracker::server::serve;

/// Test defaults: no prometheus recorder, short settle and retry intervals.
pub fn test_config(vars: &[(&str, &str)]) -> Config {
    let mut env: HashMap<String, String> = [
        ("EXPORT_PROMETHEUS", "false"),
        ("SETTLE_TIMEOUT_MS", "50"),
        ("RETRY_INITIAL_INTERVAL_MS", "10"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in vars {
        env.insert(k.to_string(), v.to_string());
    }
    Config::init_from_hashmap(&env).expect("invalid test config")
}

pub struct ServerHandle {
    pub addr: SocketAddr,
    client: reqwest::Client,
    shutdown: Arc<Notify>,
}

impl ServerHandle {
    pub async fn for_config(config: Config) -> ServerHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        tokio::spawn(async move {
            serve(config, listener, async move { notify.notified().await })
                .await
                .expect("server failed")
        });
        ServerHandle {
            addr,
            client: reqwest::Client::new(),
            shutdown,
        }
    }

    pub async fn post<T: Into<reqwest::Body>>(&self, path: &str, body: T) -> reqwest::Response {
        self.client
            .post(format!("http://{:?}{}", self.addr, path))
            .body(body)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> reqwest::Response {
        self.post(path, body.to_string()).await
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("http://{:?}{}", self.addr, path))
            .send()
            .await
            .expect("failed to send request")
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}

/// Poll a mock until it has been hit `hits` times, for fire-and-forget requests.
pub async fn wait_for_hits(mock: &httpmock::Mock<'_>, hits: usize) {
    for _ in 0..100 {
        if mock.hits() >= hits {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
