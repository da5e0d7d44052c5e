use crate::config::EngineConfig;
use crate::engine::{ClientInfo, EngineResults, MeasurementEngine, Server};
use crate::error::MeasurementError;
use crate::measure::round3;
use chrono::Utc;
use log::{debug, info, warn};
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use std::time::{Duration, Instant};

const DOWNLOAD_SIZES: [u32; 10] = [350, 500, 750, 1000, 1500, 2000, 2500, 3000, 3500, 4000];
const DOWNLOAD_COUNT: usize = 4;
const UPLOAD_SIZES: [usize; 6] = [32768, 65536, 131072, 262144, 524288, 1048576];
const UPLOAD_COUNT: usize = 4;
const PAYLOAD_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const PAYLOAD_PREFIX: &[u8] = b"content1=";
// A failed latency sample counts as one hour.
const FAILED_SAMPLE_SECS: f64 = 3600.0;

/// Measurement engine backed by the public speedtest.net HTTP endpoints.
pub struct SpeedtestNet {
    client: reqwest::Client,
    config: EngineConfig,
    client_info: Option<ClientInfo>,
    best: Option<(Server, f64)>,
}

impl SpeedtestNet {
    pub fn new(config: &EngineConfig) -> Result<Self, MeasurementError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("pidata-speedtest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            config: config.clone(),
            client_info: None,
            best: None,
        })
    }

    fn selected(&self) -> Result<&Server, MeasurementError> {
        self.best
            .as_ref()
            .map(|(server, _)| server)
            .ok_or_else(|| MeasurementError::Engine("No server selected yet".to_string()))
    }

    async fn fetch_client_info(&self) -> Result<ClientInfo, MeasurementError> {
        let body = self
            .client
            .get(&self.config.config_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        parse_client_info(&body)
            .ok_or_else(|| MeasurementError::Engine("Speedtest config has no client element".to_string()))
    }

    async fn fetch_servers(&self) -> Result<Vec<Server>, MeasurementError> {
        let servers: Vec<Server> = self
            .client
            .get(&self.config.servers_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!("Fetched {} candidate servers", servers.len());
        Ok(servers)
    }

    /// Average latency to `server` in seconds.
    async fn latency(&self, server: &Server) -> f64 {
        let base = server_base(&server.url);
        let samples = self.config.latency_samples.max(1);
        let mut total = 0.0;

        for i in 0..samples {
            let url = format!("{}/latency.txt?x={}.{}", base, cache_buster(), i);
            let start = Instant::now();
            let answered = match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => response
                    .text()
                    .await
                    .map(|body| body.starts_with("test=test"))
                    .unwrap_or(false),
                Ok(response) => {
                    debug!("Latency probe to {} returned {}", server.host, response.status());
                    false
                }
                Err(e) => {
                    debug!("Latency probe to {} failed: {}", server.host, e);
                    false
                }
            };
            total += if answered {
                start.elapsed().as_secs_f64()
            } else {
                FAILED_SAMPLE_SECS
            };
        }

        total / samples as f64
    }
}

impl MeasurementEngine for SpeedtestNet {
    async fn get_best_server(&mut self) -> Result<Server, MeasurementError> {
        let client_info = self.fetch_client_info().await?;
        info!("Testing from {} ({})", client_info.isp, client_info.ip);
        self.client_info = Some(client_info);

        let servers = self.fetch_servers().await?;
        if servers.is_empty() {
            return Err(MeasurementError::NoServerReachable(
                "Server list is empty".to_string(),
            ));
        }

        let mut timed = Vec::new();
        for server in servers.into_iter().take(self.config.latency_candidates.max(1)) {
            let latency = self.latency(&server).await;
            debug!("Server {} ({}): {:.3} s", server.id, server.host, latency);
            timed.push((server, latency));
        }

        let (server, latency) = pick_best(timed).ok_or_else(|| {
            MeasurementError::NoServerReachable(
                "No candidate server answered the latency probe".to_string(),
            )
        })?;

        let ping_ms = round3(latency * 1000.0);
        info!(
            "Selected server {} hosted by {} ({}) at {} ms",
            server.id, server.sponsor, server.name, ping_ms
        );
        self.best = Some((server.clone(), ping_ms));
        Ok(server)
    }

    async fn download(&mut self) -> Result<f64, MeasurementError> {
        let base = server_base(&self.selected()?.url).to_string();
        let deadline = self.config.test_length();
        let start = Instant::now();
        let mut bytes: u64 = 0;

        'sizes: for size in DOWNLOAD_SIZES {
            for i in 0..DOWNLOAD_COUNT {
                if start.elapsed() >= deadline {
                    break 'sizes;
                }

                let url = format!("{}/random{}x{}.jpg?x={}.{}", base, size, size, cache_buster(), i);
                let mut response = match self.client.get(&url).send().await.and_then(|r| r.error_for_status()) {
                    Ok(response) => response,
                    Err(e) if bytes > 0 => {
                        warn!("Download stopped early: {}", e);
                        break 'sizes;
                    }
                    Err(e) => return Err(e.into()),
                };

                loop {
                    match response.chunk().await {
                        Ok(Some(chunk)) => bytes += chunk.len() as u64,
                        Ok(None) => break,
                        Err(e) if bytes > 0 => {
                            warn!("Download stopped early: {}", e);
                            break 'sizes;
                        }
                        Err(e) => return Err(e.into()),
                    }
                    if start.elapsed() >= deadline {
                        break 'sizes;
                    }
                }
            }
        }

        throughput(bytes, start.elapsed())
    }

    async fn upload(&mut self, pre_allocate: bool) -> Result<f64, MeasurementError> {
        let url = self.selected()?.url.clone();
        let plan: Vec<usize> = UPLOAD_SIZES
            .iter()
            .flat_map(|&size| std::iter::repeat(size).take(UPLOAD_COUNT))
            .collect();

        let mut prepared: Vec<Vec<u8>> = if pre_allocate {
            plan.iter().rev().map(|&size| upload_payload(size)).collect()
        } else {
            Vec::new()
        };

        let deadline = self.config.test_length();
        let start = Instant::now();
        let mut bytes: u64 = 0;

        for &size in &plan {
            if start.elapsed() >= deadline {
                break;
            }

            let body = prepared.pop().unwrap_or_else(|| upload_payload(size));
            let len = body.len() as u64;
            let result = self
                .client
                .post(format!("{}?x={}", url, cache_buster()))
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(body)
                .send()
                .await
                .and_then(|r| r.error_for_status());

            match result {
                Ok(_) => bytes += len,
                Err(e) if bytes > 0 => {
                    warn!("Upload stopped early: {}", e);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        throughput(bytes, start.elapsed())
    }

    fn results(&self) -> EngineResults {
        EngineResults {
            server: self.best.as_ref().map(|(server, _)| server.clone()),
            ping_ms: self.best.as_ref().map(|(_, ping)| *ping),
            client: self.client_info.clone(),
        }
    }
}

fn cache_buster() -> i64 {
    Utc::now().timestamp_millis()
}

/// Directory part of a server's upload URL.
fn server_base(url: &str) -> &str {
    url.rsplit_once('/').map(|(base, _)| base).unwrap_or(url)
}

fn parse_client_info(xml: &str) -> Option<ClientInfo> {
    let element = Regex::new(r"<client\s([^>]*)>").ok()?;
    let attribute = Regex::new(r#"(\w+)="([^"]*)""#).ok()?;
    let attrs = element.captures(xml)?.get(1)?.as_str();

    let mut info = ClientInfo::default();
    for cap in attribute.captures_iter(attrs) {
        let value = cap[2].to_string();
        match &cap[1] {
            "ip" => info.ip = value,
            "isp" => info.isp = value,
            "lat" => info.lat = value,
            "lon" => info.lon = value,
            _ => {}
        }
    }
    Some(info)
}

/// Lowest-latency server among those that answered at least one probe.
fn pick_best(timed: Vec<(Server, f64)>) -> Option<(Server, f64)> {
    timed
        .into_iter()
        .filter(|(_, latency)| *latency < FAILED_SAMPLE_SECS)
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

fn upload_payload(size: usize) -> Vec<u8> {
    let mut body = Vec::with_capacity(size);
    body.extend_from_slice(PAYLOAD_PREFIX);
    body.extend(
        PAYLOAD_CHARS
            .iter()
            .cycle()
            .take(size.saturating_sub(PAYLOAD_PREFIX.len())),
    );
    body.truncate(size);
    body
}

fn throughput(bytes: u64, elapsed: Duration) -> Result<f64, MeasurementError> {
    let secs = elapsed.as_secs_f64();
    if bytes == 0 || secs <= 0.0 {
        return Err(MeasurementError::Engine("No data transferred".to_string()));
    }
    Ok(bytes as f64 * 8.0 / secs)
}
