//! Best-effort rotating HTTP proxy pool.
//!
//! A background task periodically scrapes a public proxy list page,
//! health-checks the candidates with bounded concurrency and swaps the
//! healthy subset into a shared pool. Adapters configured with
//! `proxy = "auto"` take addresses from here; the request path never
//! waits for the automation. No guarantee stronger than "eventually
//! zero or more working proxies" is intended.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::Notify;

use crate::config::SharedConfig;

const USER_AGENT: &str = "Mozilla/5.0";

#[derive(Default)]
pub struct ProxyPool {
    inner: Mutex<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    healthy: Vec<String>,
    cursor: usize,
}

impl ProxyPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Round-robins over the healthy set; `None` when it is empty.
    pub fn current_proxy(&self) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        if inner.healthy.is_empty() {
            return None;
        }
        let index = inner.cursor % inner.healthy.len();
        inner.cursor = inner.cursor.wrapping_add(1);
        Some(inner.healthy[index].clone())
    }

    pub fn replace(&self, healthy: Vec<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.healthy = healthy;
        inner.cursor = 0;
    }

    pub fn clear(&self) {
        self.replace(Vec::new());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().healthy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Extracts `http://ip:port` candidates from the proxy list page.
/// Only rows advertising HTTPS support are kept.
pub fn parse_proxy_list(html: &str) -> Vec<String> {
    let body = match html
        .split("<tbody>")
        .nth(1)
        .and_then(|rest| rest.split("</tbody>").next())
    {
        Some(body) => body,
        None => return Vec::new(),
    };

    let mut proxies = Vec::new();
    for row in body.split("<tr>").skip(1) {
        let cells: Vec<&str> = row
            .split("<td>")
            .skip(1)
            .map(|cell| cell.split("</td>").next().unwrap_or("").trim())
            .collect();
        if cells.len() < 7 {
            continue;
        }
        let (ip, port, https) = (cells[0], cells[1], cells[6]);
        let ip_ok = ip.split('.').count() == 4 && ip.split('.').all(|o| o.parse::<u8>().is_ok());
        if ip_ok && port.parse::<u16>().is_ok() && https.to_lowercase().contains("yes") {
            proxies.push(format!("http://{}:{}", ip, port));
        }
    }
    proxies
}

async fn check_proxy(proxy: &str, check_url: &str, timeout: Duration) -> bool {
    let client = match reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .proxy(match reqwest::Proxy::all(proxy) {
            Ok(p) => p,
            Err(_) => return false,
        })
        .build()
    {
        Ok(client) => client,
        Err(_) => return false,
    };

    match client.get(check_url).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

pub struct ProxyAutomation {
    pool: Arc<ProxyPool>,
    config: SharedConfig,
    shutdown: Arc<Notify>,
}

impl ProxyAutomation {
    pub fn new(pool: Arc<ProxyPool>, config: SharedConfig, shutdown: Arc<Notify>) -> Self {
        Self {
            pool,
            config,
            shutdown,
        }
    }

    /// Refresh loop. Returns immediately when automation is disabled.
    pub async fn run(self) {
        if !self.config.proxy_automation.enabled {
            return;
        }
        info!("Starting proxy automation loop");
        let interval = Duration::from_secs(self.config.proxy_automation.check_interval_seconds);
        loop {
            match self.refresh().await {
                Ok(count) => info!("Proxy refresh finished, {} healthy proxies", count),
                Err(err) => error!("Error searching for working proxies: {}", err),
            }
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Proxy automation loop finished");
    }

    /// Fetches the candidate list and replaces the pool with whatever
    /// passes the health check.
    pub async fn refresh(&self) -> Result<usize, anyhow::Error> {
        let settings = &self.config.proxy_automation;
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(settings.check_timeout_seconds))
            .build()?;

        debug!("Downloading proxy list from {}", settings.list_url);
        let html = client
            .get(&settings.list_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let candidates = parse_proxy_list(&html);
        if candidates.is_empty() {
            warn!("Proxy list is empty");
            self.pool.clear();
            return Ok(0);
        }
        debug!("Checking {} proxy candidates", candidates.len());

        let check_url = settings.check_url.clone();
        let timeout = Duration::from_secs(settings.check_timeout_seconds);
        let healthy: Vec<String> = stream::iter(candidates)
            .map(|proxy| {
                let check_url = check_url.clone();
                async move {
                    if check_proxy(&proxy, &check_url, timeout).await {
                        Some(proxy)
                    } else {
                        None
                    }
                }
            })
            .buffer_unordered(settings.max_checkers.max(1))
            .filter_map(|result| async move { result })
            .collect()
            .await;

        let count = healthy.len();
        self.pool.replace(healthy);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        <table><tbody>
        <tr><td>1.2.3.4</td><td>8080</td><td>US</td><td>United States</td><td>anonymous</td><td>no</td><td>yes</td><td>1 min ago</td></tr>
        <tr><td>5.6.7.8</td><td>3128</td><td>DE</td><td>Germany</td><td>elite proxy</td><td>no</td><td>no</td><td>2 mins ago</td></tr>
        <tr><td>bad.ip.addr</td><td>80</td><td>--</td><td>--</td><td>--</td><td>no</td><td>yes</td><td>now</td></tr>
        <tr><td>9.9.9.9</td><td>notaport</td><td>--</td><td>--</td><td>--</td><td>no</td><td>yes</td><td>now</td></tr>
        <tr><td>10.0.0.1</td><td>8888</td><td>FR</td><td>France</td><td>anonymous</td><td>yes</td><td>Yes</td><td>now</td></tr>
        </tbody></table>
    "#;

    #[test]
    fn parses_only_valid_https_rows() {
        let proxies = parse_proxy_list(SAMPLE);
        assert_eq!(
            proxies,
            vec![
                "http://1.2.3.4:8080".to_owned(),
                "http://10.0.0.1:8888".to_owned()
            ]
        );
    }

    #[test]
    fn parse_tolerates_garbage() {
        assert!(parse_proxy_list("").is_empty());
        assert!(parse_proxy_list("<html>nothing here</html>").is_empty());
        assert!(parse_proxy_list("<tbody></tbody>").is_empty());
    }

    #[test]
    fn pool_round_robins_and_clears() {
        let pool = ProxyPool::new();
        assert!(pool.current_proxy().is_none());

        pool.replace(vec!["http://a:1".to_owned(), "http://b:2".to_owned()]);
        assert_eq!(pool.current_proxy().as_deref(), Some("http://a:1"));
        assert_eq!(pool.current_proxy().as_deref(), Some("http://b:2"));
        assert_eq!(pool.current_proxy().as_deref(), Some("http://a:1"));

        pool.clear();
        assert!(pool.is_empty());
        assert!(pool.current_proxy().is_none());
    }
}
