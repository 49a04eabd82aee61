use crate::error::PoolError;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// The viewer's index page links its loaded profile as
/// `/<token>/profile.json`; the first path segment is the session token the
/// proxy needs. This is the only place that knows the shape of that page.
static SESSION_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/([^/]+)/profile\.json").expect("valid regex"));

/// Poll a freshly launched viewer until it reveals its session token.
///
/// Connection errors and non-matching bodies are retried on `interval`
/// until `deadline` has elapsed; the first attempt fires immediately.
pub async fn discover_session(
    client: &Client,
    port: u16,
    deadline: Duration,
    interval: Duration,
) -> Result<String, PoolError> {
    let url = format!("http://127.0.0.1:{port}/");
    let started = Instant::now();
    loop {
        if let Some(token) = try_fetch_token(client, &url, deadline).await {
            return Ok(token);
        }
        if started.elapsed() >= deadline {
            return Err(PoolError::DiscoveryTimeout {
                port,
                timeout: deadline,
            });
        }
        sleep(interval).await;
    }
}

async fn try_fetch_token(client: &Client, url: &str, deadline: Duration) -> Option<String> {
    let resp = client.get(url).timeout(deadline).send().await.ok()?;
    let body = resp.text().await.ok()?;
    extract_token(&body)
}

fn extract_token(body: &str) -> Option<String> {
    SESSION_TOKEN
        .captures(body)
        .map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn extracts_the_first_token() {
        let body = r#"<a href="/yHFyMyCN0zQDEQGGrvSe1w/profile.json">profile</a>"#;
        assert_eq!(
            extract_token(body).as_deref(),
            Some("yHFyMyCN0zQDEQGGrvSe1w")
        );
    }

    #[test]
    fn ignores_pages_without_a_profile_link() {
        assert_eq!(extract_token("<html>starting up</html>"), None);
        assert_eq!(extract_token(""), None);
        // A bare /profile.json has no token segment to capture.
        assert_eq!(extract_token("see profile.json here"), None);
    }

    #[tokio::test]
    async fn gives_up_within_the_deadline_when_nothing_listens() {
        let client = Client::new();
        // Grab a port and release it so the probe hits a closed port.
        let port = {
            let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let started = std::time::Instant::now();
        let err = discover_session(
            &client,
            port,
            Duration::from_millis(250),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PoolError::DiscoveryTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn finds_the_token_once_the_page_serves() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let body = r#"<a href="/abc123/profile.json">p</a>"#;
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(resp.as_bytes()).await;
            }
        });

        let client = Client::new();
        let token = discover_session(
            &client,
            port,
            Duration::from_secs(2),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert_eq!(token, "abc123");
    }
}
