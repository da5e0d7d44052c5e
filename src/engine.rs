use crate::error::MeasurementError;
use serde::Deserialize;

/// A remote test server as listed by the engine.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub sponsor: String,
    pub country: String,
    pub host: String,
    /// Upload endpoint; other endpoints live next to it.
    pub url: String,
    pub lat: String,
    pub lon: String,
}

/// The measuring host as seen by the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientInfo {
    pub ip: String,
    pub isp: String,
    pub lat: String,
    pub lon: String,
}

/// Everything the engine knows after a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineResults {
    pub server: Option<Server>,
    pub ping_ms: Option<f64>,
    pub client: Option<ClientInfo>,
}

/// Server selection and throughput measurement. Calls are expected in
/// order: `get_best_server`, `download`, `upload`, then `results`.
#[allow(async_fn_in_trait)]
pub trait MeasurementEngine {
    async fn get_best_server(&mut self) -> Result<Server, MeasurementError>;

    /// Download throughput in bits per second.
    async fn download(&mut self) -> Result<f64, MeasurementError>;

    /// Upload throughput in bits per second.
    async fn upload(&mut self, pre_allocate: bool) -> Result<f64, MeasurementError>;

    fn results(&self) -> EngineResults;
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Scripted engine: fixed throughput, optional failures, records calls.
    #[derive(Default)]
    pub struct FakeEngine {
        pub fail_selection: bool,
        pub fail_upload: bool,
        pub calls: Vec<String>,
        pub selected: bool,
    }

    pub fn test_server() -> Server {
        Server {
            id: "4242".into(),
            name: "Oslo".into(),
            sponsor: "Example Net".into(),
            country: "Norway".into(),
            host: "speed.example:8080".into(),
            url: "http://speed.example:8080/speedtest/upload.php".into(),
            lat: "59.91".into(),
            lon: "10.75".into(),
        }
    }

    impl MeasurementEngine for FakeEngine {
        async fn get_best_server(&mut self) -> Result<Server, MeasurementError> {
            self.calls.push("select".into());
            if self.fail_selection {
                return Err(MeasurementError::NoServerReachable("none".into()));
            }
            self.selected = true;
            Ok(test_server())
        }

        async fn download(&mut self) -> Result<f64, MeasurementError> {
            self.calls.push("download".into());
            Ok(123_456_000.0)
        }

        async fn upload(&mut self, pre_allocate: bool) -> Result<f64, MeasurementError> {
            self.calls.push(format!("upload(pre_allocate={})", pre_allocate));
            if self.fail_upload {
                return Err(MeasurementError::Timeout("upload".into()));
            }
            Ok(9_876_543.21)
        }

        fn results(&self) -> EngineResults {
            EngineResults {
                server: self.selected.then(test_server),
                ping_ms: Some(14.25),
                client: Some(ClientInfo {
                    ip: "198.51.100.4".into(),
                    isp: "".into(),
                    ..ClientInfo::default()
                }),
            }
        }
    }
}
