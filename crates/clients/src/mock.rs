//! In-memory backends mirroring the HTTP adapters' conflict and not-found
//! behavior. Each instance owns its state; calls are recorded in order and
//! any operation can be made to fail a given number of times.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tenant_manifest::{DeployedApp, DeploymentDescriptor};

use crate::error::{ClientError, ClientResult};
use crate::{DeploymentClient, FileUpload, HarborClient, Registry, RegistryClient, Robot, RobotCredential, UploadReceipt};

/// Injected failures keyed by operation name.
#[derive(Default)]
struct Faults {
    pending: HashMap<String, (ClientError, Option<u32>)>,
}

impl Faults {
    fn set(&mut self, op: &str, err: ClientError, times: Option<u32>) {
        self.pending.insert(op.to_string(), (err, times));
    }

    fn take(&mut self, op: &str) -> ClientResult<()> {
        let Some((err, left)) = self.pending.get_mut(op) else { return Ok(()) };
        let err = err.clone();
        let spent = match left {
            None => false,
            Some(n) if *n <= 1 => true,
            Some(n) => {
                *n -= 1;
                false
            }
        };
        if spent {
            self.pending.remove(op);
        }
        Err(err)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

// ----------------- Harbor -----------------

#[derive(Default)]
struct HarborState {
    calls: Vec<String>,
    faults: Faults,
    next_id: i64,
    projects: BTreeMap<String, i64>,
    members: BTreeSet<(String, String, i64)>,
    robots: BTreeMap<String, RobotCredential>,
    configuration: Option<serde_json::Value>,
}

#[derive(Clone, Default)]
pub struct MockHarbor {
    state: Arc<Mutex<HarborState>>,
}

impl MockHarbor {
    pub fn new() -> Self { Self::default() }

    /// Fail `op` with `err`; `times = None` fails forever.
    pub fn fail(&self, op: &str, err: ClientError, times: Option<u32>) { lock(&self.state).faults.set(op, err, times); }

    pub fn calls(&self) -> Vec<String> { lock(&self.state).calls.clone() }
    pub fn projects(&self) -> Vec<String> { lock(&self.state).projects.keys().cloned().collect() }
    pub fn members(&self, project: &str) -> Vec<(String, i64)> {
        lock(&self.state).members.iter().filter(|(p, _, _)| p == project).map(|(_, g, r)| (g.clone(), *r)).collect()
    }
    /// Robot credential currently valid for `project`/`robot`.
    pub fn robot(&self, project: &str, robot: &str) -> Option<RobotCredential> {
        lock(&self.state).robots.get(&format!("{}+{}", project, robot)).cloned()
    }
    pub fn configuration(&self) -> Option<serde_json::Value> { lock(&self.state).configuration.clone() }

    fn enter(&self, op: &str) -> ClientResult<MutexGuard<'_, HarborState>> {
        let mut st = lock(&self.state);
        st.calls.push(op.to_string());
        st.faults.take(op)?;
        Ok(st)
    }
}

#[async_trait::async_trait]
impl HarborClient for MockHarbor {
    async fn ping(&self) -> ClientResult<()> {
        self.enter("ping")?;
        Ok(())
    }

    async fn apply_configuration(&self, config: &serde_json::Value) -> ClientResult<()> {
        self.enter("apply_configuration")?.configuration = Some(config.clone());
        Ok(())
    }

    async fn create_project(&self, name: &str) -> ClientResult<()> {
        let mut st = self.enter("create_project")?;
        if st.projects.contains_key(name) {
            return Err(ClientError::Conflict(format!("project {} already exists", name)));
        }
        st.next_id += 1;
        let id = st.next_id;
        st.projects.insert(name.to_string(), id);
        Ok(())
    }

    async fn get_project_id(&self, name: &str) -> ClientResult<i64> {
        let st = self.enter("get_project_id")?;
        st.projects.get(name).copied().ok_or_else(|| ClientError::NotFound(format!("project {}", name)))
    }

    async fn delete_project(&self, name: &str) -> ClientResult<()> {
        let mut st = self.enter("delete_project")?;
        if st.projects.remove(name).is_none() {
            return Err(ClientError::NotFound(format!("project {}", name)));
        }
        st.members.retain(|(p, _, _)| p != name);
        Ok(())
    }

    async fn set_member_permissions(&self, project: &str, group: &str, role_id: i64) -> ClientResult<()> {
        let mut st = self.enter("set_member_permissions")?;
        if !st.projects.contains_key(project) {
            return Err(ClientError::NotFound(format!("project {}", project)));
        }
        if st.members.iter().any(|(p, g, _)| p == project && g == group) {
            return Err(ClientError::Conflict(format!("group {} is already a member", group)));
        }
        st.members.insert((project.to_string(), group.to_string(), role_id));
        Ok(())
    }

    async fn get_robot(&self, project: &str, robot: &str) -> ClientResult<Option<Robot>> {
        let st = self.enter("get_robot")?;
        Ok(st.robots.get(&format!("{}+{}", project, robot)).map(|c| Robot { id: c.id, name: c.name.clone() }))
    }

    async fn create_robot(&self, project: &str, robot: &str) -> ClientResult<RobotCredential> {
        let mut st = self.enter("create_robot")?;
        let key = format!("{}+{}", project, robot);
        if st.robots.contains_key(&key) {
            return Err(ClientError::Conflict(format!("robot {} already exists", key)));
        }
        st.next_id += 1;
        let id = st.next_id;
        let cred = RobotCredential { id, name: format!("robot${}", key), secret: format!("secret-{}", id) };
        st.robots.insert(key, cred.clone());
        Ok(cred)
    }

    async fn delete_robot(&self, id: i64) -> ClientResult<()> {
        let mut st = self.enter("delete_robot")?;
        let before = st.robots.len();
        st.robots.retain(|_, c| c.id != id);
        if st.robots.len() == before {
            return Err(ClientError::NotFound(format!("robot {}", id)));
        }
        Ok(())
    }
}

// ----------------- Catalog -----------------

#[derive(Default)]
struct CatalogState {
    calls: Vec<String>,
    faults: Faults,
    initialized: bool,
    next_session: u64,
    registries: BTreeMap<String, BTreeMap<String, Registry>>,
    sessions: HashMap<String, Vec<String>>,
    committed: BTreeMap<String, BTreeSet<String>>,
    uploads: Vec<(String, FileUpload)>,
    wiped: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockCatalog {
    state: Arc<Mutex<CatalogState>>,
}

impl MockCatalog {
    pub fn new() -> Self { Self::default() }

    pub fn fail(&self, op: &str, err: ClientError, times: Option<u32>) { lock(&self.state).faults.set(op, err, times); }

    pub fn calls(&self) -> Vec<String> { lock(&self.state).calls.clone() }
    pub fn registry(&self, project_uuid: &str, name: &str) -> Option<Registry> {
        lock(&self.state).registries.get(project_uuid).and_then(|m| m.get(name)).cloned()
    }
    pub fn uploads(&self) -> Vec<(String, FileUpload)> { lock(&self.state).uploads.clone() }
    /// File names accepted by a completed upload batch for the project.
    pub fn committed(&self, project_uuid: &str) -> Vec<String> {
        lock(&self.state).committed.get(project_uuid).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }
    pub fn wiped(&self) -> Vec<String> { lock(&self.state).wiped.clone() }

    fn enter(&self, op: &str) -> ClientResult<MutexGuard<'_, CatalogState>> {
        let mut st = lock(&self.state);
        st.calls.push(op.to_string());
        st.faults.take(op)?;
        if op != "initialize_client_secret" && !st.initialized {
            return Err(ClientError::Unauthorized("no access token".into()));
        }
        Ok(st)
    }
}

#[async_trait::async_trait]
impl RegistryClient for MockCatalog {
    async fn initialize_client_secret(&self) -> ClientResult<()> {
        self.enter("initialize_client_secret")?.initialized = true;
        Ok(())
    }

    async fn create_or_update_registry(&self, project_uuid: &str, registry: &Registry) -> ClientResult<()> {
        let mut st = self.enter("create_or_update_registry")?;
        st.registries.entry(project_uuid.to_string()).or_default().insert(registry.name.clone(), registry.clone());
        Ok(())
    }

    async fn list_registries(&self, project_uuid: &str) -> ClientResult<Vec<Registry>> {
        let st = self.enter("list_registries")?;
        Ok(st.registries.get(project_uuid).map(|m| m.values().cloned().collect()).unwrap_or_default())
    }

    async fn upload_file(&self, project_uuid: &str, upload: &FileUpload) -> ClientResult<UploadReceipt> {
        let mut st = self.enter("upload_file")?;
        st.uploads.push((project_uuid.to_string(), upload.clone()));
        let session = match &upload.session_id {
            Some(s) if !s.is_empty() => s.clone(),
            _ => {
                st.next_session += 1;
                format!("session-{}", st.next_session)
            }
        };
        st.sessions.entry(session.clone()).or_default().push(upload.file_name.clone());
        if upload.last {
            let files = st.sessions.remove(&session).unwrap_or_default();
            let committed = st.committed.entry(project_uuid.to_string()).or_default();
            if let Some(dup) = files.iter().find(|f| committed.contains(*f)) {
                return Err(ClientError::Conflict(format!("{} already exists", dup)));
            }
            committed.extend(files);
        }
        Ok(UploadReceipt { session_id: session })
    }

    async fn wipe_project(&self, project_uuid: &str) -> ClientResult<()> {
        let mut st = self.enter("wipe_project")?;
        st.registries.remove(project_uuid);
        st.committed.remove(project_uuid);
        st.wiped.push(project_uuid.to_string());
        Ok(())
    }
}

// ----------------- Deployment manager -----------------

#[derive(Default)]
struct DeploymentState {
    calls: Vec<String>,
    faults: Faults,
    next_id: u64,
    deployments: BTreeMap<String, Vec<DeployedApp>>,
}

#[derive(Clone, Default)]
pub struct MockDeployments {
    state: Arc<Mutex<DeploymentState>>,
}

impl MockDeployments {
    pub fn new() -> Self { Self::default() }

    pub fn fail(&self, op: &str, err: ClientError, times: Option<u32>) { lock(&self.state).faults.set(op, err, times); }

    pub fn calls(&self) -> Vec<String> { lock(&self.state).calls.clone() }

    /// Pre-existing deployment, as if created out of band.
    pub fn seed(&self, project_uuid: &str, app_name: &str, version: &str, profile_name: &str) -> String {
        let mut st = lock(&self.state);
        st.next_id += 1;
        let id = format!("deploy-{}", st.next_id);
        let app = DeployedApp { id: id.clone(), app_name: app_name.into(), version: version.into(), profile_name: profile_name.into() };
        st.deployments.entry(project_uuid.to_string()).or_default().push(app);
        id
    }

    pub fn deployed(&self, project_uuid: &str) -> Vec<DeployedApp> {
        lock(&self.state).deployments.get(project_uuid).cloned().unwrap_or_default()
    }

    fn enter(&self, op: &str) -> ClientResult<MutexGuard<'_, DeploymentState>> {
        let mut st = lock(&self.state);
        st.calls.push(op.to_string());
        st.faults.take(op)?;
        Ok(st)
    }
}

#[async_trait::async_trait]
impl DeploymentClient for MockDeployments {
    async fn list_deployments(&self, project_uuid: &str) -> ClientResult<Vec<DeployedApp>> {
        let st = self.enter("list_deployments")?;
        Ok(st.deployments.get(project_uuid).cloned().unwrap_or_default())
    }

    async fn create_deployment(&self, project_uuid: &str, deployment: &DeploymentDescriptor) -> ClientResult<()> {
        let mut st = self.enter("create_deployment")?;
        let key = deployment.key();
        if st.deployments.get(project_uuid).map(|v| v.iter().any(|d| d.key() == key)).unwrap_or(false) {
            return Err(ClientError::Conflict(format!("deployment {} {} exists", deployment.app_name, deployment.version)));
        }
        st.next_id += 1;
        let app = DeployedApp {
            id: format!("deploy-{}", st.next_id),
            app_name: deployment.app_name.clone(),
            version: deployment.version.clone(),
            profile_name: deployment.profile_name.clone(),
        };
        st.deployments.entry(project_uuid.to_string()).or_default().push(app);
        Ok(())
    }

    async fn delete_deployment(&self, project_uuid: &str, deployment_id: &str, missing_ok: bool) -> ClientResult<()> {
        let mut st = self.enter("delete_deployment")?;
        let list = st.deployments.entry(project_uuid.to_string()).or_default();
        let before = list.len();
        list.retain(|d| d.id != deployment_id);
        if list.len() == before && !missing_ok {
            return Err(ClientError::NotFound(format!("deployment {}", deployment_id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn harbor_conflicts_like_the_real_api() {
        let h = MockHarbor::new();
        h.create_project("acme-p1").await.unwrap();
        assert!(h.create_project("acme-p1").await.unwrap_err().is_conflict());
        h.set_member_permissions("acme-p1", "g", 1).await.unwrap();
        assert!(h.set_member_permissions("acme-p1", "g", 1).await.unwrap_err().is_conflict());
        assert!(h.get_project_id("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn injected_failures_count_down() {
        let h = MockHarbor::new();
        h.fail("ping", ClientError::Transport("down".into()), Some(2));
        assert!(h.ping().await.is_err());
        assert!(h.ping().await.is_err());
        assert!(h.ping().await.is_ok());
        assert_eq!(h.calls(), vec!["ping", "ping", "ping"]);
    }

    #[tokio::test]
    async fn catalog_requires_client_secret() {
        let c = MockCatalog::new();
        let reg = Registry {
            name: "r".into(),
            display_name: "r".into(),
            description: String::new(),
            kind: crate::RegistryKind::Helm,
            root_url: "oci://x".into(),
            username: None,
            auth_token: None,
            inventory_url: None,
        };
        assert!(matches!(c.create_or_update_registry("u", &reg).await, Err(ClientError::Unauthorized(_))));
        c.initialize_client_secret().await.unwrap();
        c.create_or_update_registry("u", &reg).await.unwrap();
        c.create_or_update_registry("u", &reg).await.unwrap();
        assert_eq!(c.list_registries("u").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn catalog_batch_conflicts_on_reupload() {
        let c = MockCatalog::new();
        c.initialize_client_secret().await.unwrap();
        let up = |session: Option<String>, n: u32, name: &str, last: bool| FileUpload {
            session_id: session,
            upload_number: n,
            file_name: name.into(),
            artifact: b"x".to_vec(),
            last,
        };
        let r = c.upload_file("u", &up(None, 0, "a.yaml", false)).await.unwrap();
        c.upload_file("u", &up(Some(r.session_id), 1, "b.yaml", true)).await.unwrap();
        assert_eq!(c.committed("u"), vec!["a.yaml", "b.yaml"]);
        let err = c.upload_file("u", &up(None, 0, "a.yaml", true)).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn deployments_delete_missing_ok() {
        let d = MockDeployments::new();
        let id = d.seed("u", "app", "1.0", "default");
        d.delete_deployment("u", &id, false).await.unwrap();
        assert!(d.delete_deployment("u", &id, false).await.unwrap_err().is_not_found());
        d.delete_deployment("u", &id, true).await.unwrap();
    }
}
