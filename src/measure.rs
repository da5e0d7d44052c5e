use crate::csv_log::Row;
use crate::engine::MeasurementEngine;
use crate::error::MeasurementError;
use chrono::{SecondsFormat, Utc};
use log::info;

/// Column order of the CSV log.
pub const FIELD_ORDER: [&str; 14] = [
    "device",
    "timestamp",
    "server_id",
    "server_name",
    "sponsor",
    "country",
    "host",
    "lat",
    "lon",
    "ping_ms",
    "download_mbps",
    "upload_mbps",
    "client_ip",
    "client_isp",
];

/// Result of one speed test, before a device is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub timestamp: String,
    pub server_id: Option<String>,
    pub server_name: Option<String>,
    pub sponsor: Option<String>,
    pub country: Option<String>,
    pub host: Option<String>,
    pub lat: Option<String>,
    pub lon: Option<String>,
    pub ping_ms: Option<f64>,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub client_ip: Option<String>,
    pub client_isp: Option<String>,
}

impl Measurement {
    pub fn with_device(self, device: impl Into<String>) -> MeasurementRecord {
        MeasurementRecord {
            device: device.into(),
            measurement: self,
        }
    }
}

/// One CSV row: a measurement tagged with its device.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    pub device: String,
    pub measurement: Measurement,
}

impl MeasurementRecord {
    pub fn to_row(&self) -> Row {
        let m = &self.measurement;
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();

        [
            ("device", self.device.clone()),
            ("timestamp", m.timestamp.clone()),
            ("server_id", opt(&m.server_id)),
            ("server_name", opt(&m.server_name)),
            ("sponsor", opt(&m.sponsor)),
            ("country", opt(&m.country)),
            ("host", opt(&m.host)),
            ("lat", opt(&m.lat)),
            ("lon", opt(&m.lon)),
            ("ping_ms", m.ping_ms.map(|p| p.to_string()).unwrap_or_default()),
            ("download_mbps", m.download_mbps.to_string()),
            ("upload_mbps", m.upload_mbps.to_string()),
            ("client_ip", opt(&m.client_ip)),
            ("client_isp", opt(&m.client_isp)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

pub fn bps_to_mbps(bps: f64) -> f64 {
    round3(bps / 1_000_000.0)
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Runs one full cycle: server selection, download, upload, results.
/// Upload never pre-allocates its payloads.
pub async fn run<E: MeasurementEngine>(engine: &mut E) -> Result<Measurement, MeasurementError> {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

    let server = engine.get_best_server().await?;
    info!("Measuring against server {} ({})", server.id, server.host);

    let download_bps = engine.download().await?;
    info!("Download: {:.0} bit/s", download_bps);

    let upload_bps = engine.upload(false).await?;
    info!("Upload: {:.0} bit/s", upload_bps);

    let results = engine.results();
    let server = results.server.unwrap_or_default();
    let client = results.client.unwrap_or_default();

    Ok(Measurement {
        timestamp,
        server_id: non_empty(server.id),
        server_name: non_empty(server.name),
        sponsor: non_empty(server.sponsor),
        country: non_empty(server.country),
        host: non_empty(server.host),
        lat: non_empty(server.lat),
        lon: non_empty(server.lon),
        ping_ms: results.ping_ms,
        download_mbps: bps_to_mbps(download_bps),
        upload_mbps: bps_to_mbps(upload_bps),
        client_ip: non_empty(client.ip),
        client_isp: non_empty(client.isp),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeEngine;
    use chrono::DateTime;

    #[test]
    fn converts_to_megabits() {
        assert_eq!(bps_to_mbps(123_456_000.0), 123.456);
        assert_eq!(bps_to_mbps(9_876_543.21), 9.877);
        assert_eq!(bps_to_mbps(0.0), 0.0);
    }

    #[tokio::test]
    async fn runs_full_cycle_in_order() {
        let mut engine = FakeEngine::default();
        let measurement = run(&mut engine).await.unwrap();

        assert_eq!(
            engine.calls,
            vec!["select", "download", "upload(pre_allocate=false)"]
        );
        assert_eq!(measurement.download_mbps, 123.456);
        assert_eq!(measurement.upload_mbps, 9.877);
        assert_eq!(measurement.ping_ms, Some(14.25));
        assert_eq!(measurement.server_id.as_deref(), Some("4242"));
        assert_eq!(measurement.client_ip.as_deref(), Some("198.51.100.4"));
        assert_eq!(measurement.client_isp, None);

        let parsed = DateTime::parse_from_rfc3339(&measurement.timestamp).unwrap();
        assert_eq!(parsed.offset().local_minus_utc(), 0);
        assert!(measurement.timestamp.ends_with('Z'));
    }

    #[tokio::test]
    async fn selection_failure_stops_the_cycle() {
        let mut engine = FakeEngine {
            fail_selection: true,
            ..FakeEngine::default()
        };
        let err = run(&mut engine).await.unwrap_err();
        assert!(matches!(err, MeasurementError::NoServerReachable(_)));
        assert_eq!(engine.calls, vec!["select"]);
    }

    #[tokio::test]
    async fn upload_failure_is_reported() {
        let mut engine = FakeEngine {
            fail_upload: true,
            ..FakeEngine::default()
        };
        let err = run(&mut engine).await.unwrap_err();
        assert!(matches!(err, MeasurementError::Timeout(_)));
    }

    #[tokio::test]
    async fn record_row_follows_field_order() {
        let mut engine = FakeEngine::default();
        let record = run(&mut engine).await.unwrap().with_device("B");
        let row = record.to_row();

        assert_eq!(row.len(), FIELD_ORDER.len());
        for field in FIELD_ORDER {
            assert!(row.contains_key(field), "missing {}", field);
        }
        assert_eq!(row["device"], "B");
        assert_eq!(row["download_mbps"], "123.456");
        assert_eq!(row["ping_ms"], "14.25");
        assert_eq!(row["client_isp"], "");
    }
}
