// Shared by several test binaries; not every helper is used by each one
#![allow(dead_code)]

use decs_controller::api;
use decs_controller::mock::{MockReply, MockTransport};
use decs_controller::{AuthMode, CredentialConfig, DecsClient, HttpRequest};
use decs_cloud::RetryConfig;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

pub const CONTROLLER_URL: &str = "https://ctl.example.com";
pub const RESGROUP_ID: u64 = 12;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn legacy_config() -> CredentialConfig {
    CredentialConfig::builder()
        .controller_url(CONTROLLER_URL)
        .mode(AuthMode::Legacy)
        .legacy_user("admin")
        .legacy_password("secret")
        .retry(RetryConfig::immediate(3))
        .build()
        .unwrap()
}

pub fn client(config: CredentialConfig, mock: &MockTransport) -> DecsClient {
    DecsClient::with_transport(config, Arc::new(mock.clone()))
}

#[derive(Default)]
struct ControllerState {
    next_id: u64,
    machines: BTreeMap<u64, Value>,
    /// disk id -> (label, size, attached machine)
    disks: BTreeMap<u64, (String, u64, Option<u64>)>,
    networks: BTreeMap<u64, Vec<u64>>,
    port_forwards: Vec<Value>,
    failing_attach_labels: HashSet<String>,
}

/// In-memory controller answering machine, disk, network and port forward calls
#[derive(Clone)]
pub struct FakeController {
    pub mock: MockTransport,
    state: Arc<Mutex<ControllerState>>,
}

impl FakeController {
    pub fn new() -> Self {
        let mock = MockTransport::new();
        let state = Arc::new(Mutex::new(ControllerState {
            next_id: 100,
            ..Default::default()
        }));

        mock.on(api::LEGACY_LOGIN_API, MockReply::ok("sid"));
        mock.on(
            api::RESGROUP_GET_API,
            MockReply::json(json!({
                "id": RESGROUP_ID,
                "accountId": 3,
                "gid": 212,
                "externalnetworkip": "185.1.2.3",
                "location": "ru-msk",
            })),
        );

        let fake = Self { mock, state };
        fake.route(api::MACHINE_CREATE_API, Self::machine_create);
        fake.route(api::MACHINE_GET_API, Self::machine_get);
        fake.route(api::MACHINE_DELETE_API, Self::machine_delete);
        fake.route(api::DISK_CREATE_API, Self::disk_create);
        fake.route(api::DISK_ATTACH_API, Self::disk_attach);
        fake.route(api::EXTNET_ATTACH_API, Self::network_attach);
        fake.route(api::PORTFORWARD_CREATE_API, Self::port_forward_create);
        fake.route(api::PORTFORWARD_LIST_API, Self::port_forward_list);
        fake
    }

    fn route(&self, path: &str, handler: fn(&mut ControllerState, &HttpRequest) -> MockReply) {
        let state = Arc::clone(&self.state);
        self.mock.on_fn(path, move |req| {
            let mut state = state.lock().unwrap();
            handler(&mut state, req)
        });
    }

    /// Make attaching the disk with this label fail until cleared
    pub fn fail_attach(&self, label: &str) {
        self.state.lock().unwrap().failing_attach_labels.insert(label.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failing_attach_labels.clear();
    }

    pub fn attached_disk_labels(&self, machine_id: u64) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .disks
            .values()
            .filter(|(_, _, attached)| *attached == Some(machine_id))
            .map(|(label, _, _)| label.clone())
            .collect()
    }

    pub fn created_disk_count(&self) -> usize {
        self.state.lock().unwrap().disks.len()
    }

    pub fn machine_count(&self) -> usize {
        self.state.lock().unwrap().machines.len()
    }

    fn next_id(state: &mut ControllerState) -> u64 {
        state.next_id += 1;
        state.next_id
    }

    fn int(req: &HttpRequest, key: &str) -> u64 {
        req.param(key).and_then(|v| v.parse().ok()).unwrap_or_default()
    }

    fn machine_create(state: &mut ControllerState, req: &HttpRequest) -> MockReply {
        let id = Self::next_id(state);
        state.machines.insert(
            id,
            json!({
                "id": id,
                "name": req.param("name").unwrap_or_default(),
                "status": "RUNNING",
                "cloudspaceId": Self::int(req, "cloudspaceId"),
                "vcpus": Self::int(req, "vcpus"),
                "memory": Self::int(req, "memory"),
                "storage": Self::int(req, "disksize"),
                "imageid": Self::int(req, "imageId"),
                "description": req.param("description").unwrap_or_default(),
            }),
        );
        MockReply::ok(id.to_string())
    }

    fn machine_get(state: &mut ControllerState, req: &HttpRequest) -> MockReply {
        let id = Self::int(req, "machineId");
        let Some(machine) = state.machines.get(&id) else {
            return MockReply::status(404, format!("Machine {} not found", id));
        };

        let mut machine = machine.clone();
        let disks: Vec<Value> = state
            .disks
            .iter()
            .filter(|(_, (_, _, attached))| *attached == Some(id))
            .map(|(disk_id, (label, size, _))| {
                json!({ "id": disk_id, "name": label, "type": "D", "sizeMax": size })
            })
            .collect();
        let nics: Vec<Value> = state
            .networks
            .get(&id)
            .into_iter()
            .flatten()
            .map(|net| {
                json!({
                    "type": "PUBLIC",
                    "params": format!("gateway:185.1.2.1 externalnetworkId:{}", net),
                })
            })
            .collect();
        machine["disks"] = json!(disks);
        machine["interfaces"] = json!(nics);
        MockReply::json(machine)
    }

    fn machine_delete(state: &mut ControllerState, req: &HttpRequest) -> MockReply {
        let id = Self::int(req, "machineId");
        match state.machines.remove(&id) {
            Some(_) => MockReply::ok("true"),
            None => MockReply::status(404, "not found"),
        }
    }

    fn disk_create(state: &mut ControllerState, req: &HttpRequest) -> MockReply {
        let id = Self::next_id(state);
        let label = req.param("name").unwrap_or_default().to_string();
        state.disks.insert(id, (label, Self::int(req, "size"), None));
        MockReply::ok(id.to_string())
    }

    fn disk_attach(state: &mut ControllerState, req: &HttpRequest) -> MockReply {
        let disk_id = Self::int(req, "diskId");
        let machine_id = Self::int(req, "machineId");
        let failing = &state.failing_attach_labels;
        match state.disks.get_mut(&disk_id) {
            Some((label, _, _)) if failing.contains(label.as_str()) => {
                MockReply::status(500, "attach failed")
            }
            Some((_, _, attached)) => {
                *attached = Some(machine_id);
                MockReply::ok("true")
            }
            None => MockReply::status(404, "no such disk"),
        }
    }

    fn network_attach(state: &mut ControllerState, req: &HttpRequest) -> MockReply {
        let machine_id = Self::int(req, "machineId");
        let net = Self::int(req, "externalNetworkId");
        state.networks.entry(machine_id).or_default().push(net);
        MockReply::ok("true")
    }

    fn port_forward_create(state: &mut ControllerState, req: &HttpRequest) -> MockReply {
        state.port_forwards.push(json!({
            "protocol": req.param("protocol").unwrap_or_default(),
            "publicPort": req.param("publicPort").unwrap_or_default(),
            "localPort": req.param("localPort").unwrap_or_default(),
            "publicIp": req.param("publicIp").unwrap_or_default(),
            "machineId": Self::int(req, "machineId"),
        }));
        MockReply::ok("true")
    }

    fn port_forward_list(state: &mut ControllerState, _req: &HttpRequest) -> MockReply {
        MockReply::json(json!(state.port_forwards))
    }
}
