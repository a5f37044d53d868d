use std::sync::Mutex;

/// One serving endpoint with its advertised rate. Rate weights server
/// choice; a zero-rate server is standby, used only when nothing better
/// is eligible.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEndpoint {
    /// Base URL of the server, e.g. `http://psg1:2180`.
    pub authority: String,
    pub rate: f64,
}

impl ServerEndpoint {
    pub fn new(authority: impl Into<String>, rate: f64) -> Self {
        Self {
            authority: authority.into(),
            rate,
        }
    }
}

/// Source of the serving topology, polled periodically by the client.
#[async_trait::async_trait]
pub trait ServiceDiscovery: Send + Sync + 'static {
    async fn discover(&self) -> Vec<ServerEndpoint>;
}

/// A fixed server set.
pub struct StaticDiscovery {
    endpoints: Vec<ServerEndpoint>,
}

impl StaticDiscovery {
    pub fn new(endpoints: Vec<ServerEndpoint>) -> Self {
        Self { endpoints }
    }
}

#[async_trait::async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn discover(&self) -> Vec<ServerEndpoint> {
        self.endpoints.clone()
    }
}

/// Replays a scripted sequence of discovery results, then repeats the
/// last one. Used to exercise topology changes.
pub struct ScriptedDiscovery {
    script: Mutex<Vec<Vec<ServerEndpoint>>>,
    last: Mutex<Vec<ServerEndpoint>>,
}

impl ScriptedDiscovery {
    pub fn new(script: Vec<Vec<ServerEndpoint>>) -> Self {
        Self {
            script: Mutex::new(script),
            last: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl ServiceDiscovery for ScriptedDiscovery {
    async fn discover(&self) -> Vec<ServerEndpoint> {
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            return self.last.lock().unwrap().clone();
        }
        let next = script.remove(0);
        *self.last.lock().unwrap() = next.clone();
        next
    }
}
