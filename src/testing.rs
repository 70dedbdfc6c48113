//! In-memory fakes for the external collaborators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use crate::coordinator::{Collaborators, Coordinator};
use crate::deployment::{AppSource, Deployment, DeploymentKind, DownloadProgress};
use crate::device::LocalDevice;
use crate::http::{HttpClient, HttpResponse, ProgressCallback, RateLimitStats};
use crate::ipc::enums::{Error, Exit, Info, Role};
use crate::ipc::{
    IpcBus, PropertyValue, TransactionCall, TransactionEvent, TransactionHandle, TransactionLink,
};
use crate::notify::{NotificationSink, UPDATE_RESPONSE_EVENT};
use crate::shell::{OutputCallback, ShellExecutor, ShellRequest};
use crate::storage::MemoryStore;
use crate::types::UpdateError;

// ---- notifications ----

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, Value)>>,
    warnings: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn events(&self, event: &str) -> Vec<Value> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Messages of every update response, in order.
    pub fn messages(&self) -> Vec<String> {
        self.events(UPDATE_RESPONSE_EVENT)
            .iter()
            .filter_map(|payload| payload["message"].as_str().map(str::to_string))
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn emit(&self, event: &str, payload: Value) {
        self.events
            .lock()
            .unwrap()
            .push((event.to_string(), payload));
    }

    fn warn(&self, message: &str) {
        self.warnings.lock().unwrap().push(message.to_string());
    }
}

// ---- shell ----

/// Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedShell {
    responses: Mutex<Vec<(String, String)>>,
    failures: Mutex<Vec<String>>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedShell {
    pub fn respond(&self, pattern: &str, output: &str) {
        self.responses
            .lock()
            .unwrap()
            .push((pattern.to_string(), output.to_string()));
    }

    pub fn fail_matching(&self, pattern: &str) {
        self.failures.lock().unwrap().push(pattern.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|command| command.contains(pattern))
            .count()
    }
}

#[async_trait]
impl ShellExecutor for ScriptedShell {
    async fn run(
        &self,
        request: &ShellRequest,
        on_output: Option<OutputCallback<'_>>,
    ) -> Result<String, UpdateError> {
        let command = request.command.clone();
        self.commands.lock().unwrap().push(command.clone());
        if self
            .failures
            .lock()
            .unwrap()
            .iter()
            .any(|pattern| command.contains(pattern.as_str()))
        {
            return Err(UpdateError::Command(format!("Command `{command}` failed")));
        }
        let output = self
            .responses
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default();
        if let Some(callback) = on_output {
            for line in output.lines() {
                callback(line);
            }
        }
        Ok(output)
    }
}

// ---- http ----

#[derive(Default)]
pub struct ScriptedHttp {
    responses: Mutex<HashMap<String, HttpResponse>>,
    downloads: Mutex<Vec<(String, Vec<u8>)>>,
    failure: Mutex<Option<String>>,
    requests: Mutex<Vec<String>>,
}

impl ScriptedHttp {
    pub fn respond(&self, resource: &str, response: HttpResponse) {
        self.responses
            .lock()
            .unwrap()
            .insert(resource.to_string(), response);
    }

    pub fn respond_json(&self, resource: &str, body: Value) {
        self.respond(
            resource,
            HttpResponse {
                url: resource.to_string(),
                status_code: 200,
                content: body.to_string().into_bytes(),
                error: None,
            },
        );
    }

    /// Every API request fails as if the backend were unreachable.
    pub fn fail_all(&self, error: &str) {
        *self.failure.lock().unwrap() = Some(error.to_string());
    }

    pub fn serve_download(&self, url_suffix: &str, body: Vec<u8>) {
        self.downloads
            .lock()
            .unwrap()
            .push((url_suffix.to_string(), body));
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttp {
    async fn github_api_request(
        &self,
        resource: &str,
        _attempts: u32,
        _retry_pause: Duration,
    ) -> HttpResponse {
        self.requests.lock().unwrap().push(resource.to_string());
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return HttpResponse {
                url: resource.to_string(),
                status_code: 0,
                content: Vec::new(),
                error: Some(error),
            };
        }
        self.responses
            .lock()
            .unwrap()
            .get(resource)
            .cloned()
            .unwrap_or_else(|| HttpResponse {
                url: resource.to_string(),
                status_code: 404,
                content: Vec::new(),
                error: Some(format!("{resource} returned 404 Not Found")),
            })
    }

    async fn download_file(
        &self,
        url: &str,
        _content_type: &str,
        destination: &Path,
        _size: u64,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> Result<(), UpdateError> {
        let body = self
            .downloads
            .lock()
            .unwrap()
            .iter()
            .find(|(suffix, _)| url.ends_with(suffix.as_str()))
            .map(|(_, body)| body.clone())
            .ok_or_else(|| UpdateError::Update(format!("no download served at {url}")))?;
        let total = body.len() as u64;
        tokio::fs::write(destination, &body).await?;
        if let Some(callback) = on_progress {
            for downloaded in [0, total] {
                callback(&DownloadProgress {
                    downloaded_bytes: downloaded,
                    total_bytes: Some(total),
                });
            }
        }
        Ok(())
    }

    fn github_api_stats(&self) -> RateLimitStats {
        RateLimitStats {
            github_rate_limit: Some(60),
            github_requests_remaining: Some(57),
            github_limit_reset_time: Some(1_700_000_000),
        }
    }
}

// ---- ipc ----

/// Signals one transaction emits once its method is called.
#[derive(Debug, Clone)]
pub struct ScriptedTransaction {
    events: Vec<TransactionEvent>,
}

impl ScriptedTransaction {
    pub fn new(role: Role) -> Self {
        Self {
            events: vec![TransactionEvent::PropertiesChanged(vec![(
                "Role".to_string(),
                PropertyValue::U32(role.index()),
            )])],
        }
    }

    pub fn package(mut self, info: Info, package_id: &str) -> Self {
        self.events.push(TransactionEvent::Package {
            info: info.index(),
            package_id: package_id.to_string(),
            summary: String::new(),
        });
        self
    }

    pub fn error(mut self, error: Error, details: &str) -> Self {
        self.events.push(TransactionEvent::ErrorCode {
            code: error.index(),
            details: details.to_string(),
        });
        self
    }

    pub fn finish(mut self, exit: Exit) -> Self {
        self.events.push(TransactionEvent::Finished {
            exit_code: exit.index(),
            run_time_ms: 1200,
        });
        self
    }
}

struct FakeBusState {
    connected: bool,
    denied: Mutex<Vec<String>>,
    scripts: Mutex<VecDeque<ScriptedTransaction>>,
    calls: Arc<Mutex<Vec<TransactionCall>>>,
}

#[derive(Clone)]
pub struct FakeBus {
    state: Arc<FakeBusState>,
}

impl FakeBus {
    fn with_connection(connected: bool) -> Self {
        Self {
            state: Arc::new(FakeBusState {
                connected,
                denied: Mutex::new(Vec::new()),
                scripts: Mutex::new(VecDeque::new()),
                calls: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }

    pub fn connected() -> Self {
        Self::with_connection(true)
    }

    pub fn disconnected() -> Self {
        Self::with_connection(false)
    }

    pub fn deny_permission(&self, action: &str) {
        self.state.denied.lock().unwrap().push(action.to_string());
    }

    pub fn push_script(&self, script: ScriptedTransaction) {
        self.state.scripts.lock().unwrap().push_back(script);
    }

    pub fn calls(&self) -> Vec<TransactionCall> {
        self.state.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl IpcBus for FakeBus {
    fn is_connected(&self) -> bool {
        self.state.connected
    }

    async fn check_permission(&self, action: &str) -> Result<bool, UpdateError> {
        Ok(!self.state.denied.lock().unwrap().iter().any(|a| a == action))
    }

    async fn create_transaction(&self) -> Result<TransactionLink, UpdateError> {
        let script = self
            .state
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptedTransaction::new(Role::Unknown).finish(Exit::Success));
        let (tx, events) = mpsc::unbounded_channel();
        Ok(TransactionLink {
            handle: Box::new(FakeHandle {
                tx: Mutex::new(Some(tx)),
                events: script.events,
                calls: self.state.calls.clone(),
            }),
            events,
        })
    }
}

struct FakeHandle {
    tx: Mutex<Option<mpsc::UnboundedSender<TransactionEvent>>>,
    events: Vec<TransactionEvent>,
    calls: Arc<Mutex<Vec<TransactionCall>>>,
}

#[async_trait]
impl TransactionHandle for FakeHandle {
    async fn call(&self, call: TransactionCall) -> Result<(), UpdateError> {
        self.calls.lock().unwrap().push(call);
        if let Some(tx) = self.tx.lock().unwrap().take() {
            for event in &self.events {
                let _ = tx.send(event.clone());
            }
        }
        Ok(())
    }
}

// ---- service sources ----

#[derive(Debug, Default)]
struct FakeSourceState {
    version: String,
    remote_version: String,
    refresh_error: Option<String>,
}

#[derive(Clone)]
pub struct FakeSource {
    state: Arc<Mutex<FakeSourceState>>,
}

impl FakeSource {
    pub fn new(version: &str, remote_version: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeSourceState {
                version: version.to_string(),
                remote_version: remote_version.to_string(),
                refresh_error: None,
            })),
        }
    }

    pub fn fail_refresh(&self, error: &str) {
        self.state.lock().unwrap().refresh_error = Some(error.to_string());
    }
}

#[async_trait]
impl AppSource for FakeSource {
    async fn initialize(&self, _storage: &Map<String, Value>) -> Result<(), UpdateError> {
        Ok(())
    }

    async fn refresh(&self) -> Result<String, UpdateError> {
        let state = self.state.lock().unwrap();
        match &state.refresh_error {
            Some(error) => Err(UpdateError::Command(error.clone())),
            None => Ok(state.remote_version.clone()),
        }
    }

    async fn update(&self, _coordinator: &Coordinator) -> Result<bool, UpdateError> {
        let mut state = self.state.lock().unwrap();
        if state.version == state.remote_version {
            return Ok(false);
        }
        state.version = state.remote_version.clone();
        Ok(true)
    }

    fn version(&self) -> String {
        self.state.lock().unwrap().version.clone()
    }

    fn status(&self) -> Map<String, Value> {
        Map::new()
    }

    fn persistent_data(&self) -> Map<String, Value> {
        Map::new()
    }
}

// ---- deployments ----

pub type EventLog = Arc<Mutex<Vec<String>>>;

struct FakeDeployState {
    update_result: Result<bool, String>,
    init_error: Option<String>,
    needs_refresh: bool,
    last_refresh_time: Option<DateTime<Utc>>,
    gate: Option<Arc<Notify>>,
}

/// Deployment that records each call into a shared log.
pub struct FakeDeployment {
    name: String,
    kind: DeploymentKind,
    log: EventLog,
    state: Mutex<FakeDeployState>,
}

impl FakeDeployment {
    pub fn new(name: &str, kind: DeploymentKind, log: &EventLog) -> Self {
        Self {
            name: name.to_string(),
            kind,
            log: log.clone(),
            state: Mutex::new(FakeDeployState {
                update_result: Ok(true),
                init_error: None,
                needs_refresh: true,
                last_refresh_time: None,
                gate: None,
            }),
        }
    }

    pub fn unchanged(self) -> Self {
        self.state.lock().unwrap().update_result = Ok(false);
        self
    }

    pub fn fails_update(self, error: &str) -> Self {
        self.state.lock().unwrap().update_result = Err(error.to_string());
        self
    }

    pub fn fails_init(self, error: &str) -> Self {
        self.state.lock().unwrap().init_error = Some(error.to_string());
        self
    }

    pub fn fresh(self) -> Self {
        self.state.lock().unwrap().needs_refresh = false;
        self
    }

    /// Hold `update` until the gate is notified.
    pub fn gated(self, gate: &Arc<Notify>) -> Self {
        self.state.lock().unwrap().gate = Some(gate.clone());
        self
    }

    pub fn into_arc(self) -> Arc<dyn Deployment> {
        Arc::new(self)
    }

    fn record(&self, action: &str) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{action}:{}", self.name));
    }
}

#[async_trait]
impl Deployment for FakeDeployment {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeploymentKind {
        self.kind
    }

    async fn initialize(&self) -> Result<(), UpdateError> {
        self.record("init");
        match self.state.lock().unwrap().init_error.clone() {
            Some(error) => Err(UpdateError::Config(error)),
            None => Ok(()),
        }
    }

    fn needs_refresh(&self, _log: bool) -> bool {
        self.state.lock().unwrap().needs_refresh
    }

    fn last_refresh_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().last_refresh_time
    }

    async fn refresh(&self) {
        self.record("refresh");
        let mut state = self.state.lock().unwrap();
        state.last_refresh_time = Some(Utc::now());
        state.needs_refresh = false;
    }

    async fn update(&self) -> Result<bool, UpdateError> {
        self.record("update");
        let gate = self.state.lock().unwrap().gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.state
            .lock()
            .unwrap()
            .update_result
            .clone()
            .map_err(UpdateError::Update)
    }

    async fn rollback(&self) -> Result<bool, UpdateError> {
        self.record("rollback");
        Ok(true)
    }

    async fn restart_service(&self) -> Result<(), UpdateError> {
        self.record("restart");
        Ok(())
    }

    fn get_status(&self) -> Value {
        json!({ "name": self.name })
    }

    async fn close(&self) {
        self.record("close");
    }
}

// ---- harness ----

pub struct TestHarness {
    pub coordinator: Arc<Coordinator>,
    pub sink: Arc<RecordingSink>,
    pub shell: Arc<ScriptedShell>,
    pub http: Arc<ScriptedHttp>,
    pub store: Arc<MemoryStore>,
    pub device: Arc<LocalDevice>,
    bus: Option<FakeBus>,
}

pub struct HarnessBuilder {
    bus: Option<FakeBus>,
    distribution: String,
    refresh_interval: Duration,
}

impl HarnessBuilder {
    pub fn bus(mut self, bus: FakeBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn distribution(mut self, distribution: &str) -> Self {
        self.distribution = distribution.to_string();
        self
    }

    pub fn build(self) -> TestHarness {
        let sink = Arc::new(RecordingSink::default());
        let shell = Arc::new(ScriptedShell::default());
        let http = Arc::new(ScriptedHttp::default());
        let store = Arc::new(MemoryStore::new());
        let device = Arc::new(LocalDevice::new(self.distribution));
        let collaborators = Collaborators {
            store: store.clone(),
            http: http.clone(),
            shell: shell.clone(),
            sink: sink.clone(),
            device: device.clone(),
            bus: self
                .bus
                .clone()
                .map(|bus| Arc::new(bus) as Arc<dyn IpcBus>),
        };
        TestHarness {
            coordinator: Arc::new(Coordinator::new(collaborators, self.refresh_interval)),
            sink,
            shell,
            http,
            store,
            device,
            bus: self.bus,
        }
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            bus: None,
            distribution: "debian".to_string(),
            refresh_interval: Duration::from_secs(168 * 60 * 60),
        }
    }

    pub fn bus(&self) -> Arc<dyn IpcBus> {
        Arc::new(self.bus.clone().expect("harness built without a bus"))
    }
}
