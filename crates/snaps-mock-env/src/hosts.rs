use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use semver::{Version, VersionReq};
use serde_json::{json, Value};
use snaps_core::checksum::source_shasum;
use snaps_core::{ManifestSource, PermissionSet, SnapId, SnapManifest};
use snaps_protocol::{RpcErrorObject, RpcRequest};
use snaps_runtime::{
    ApprovalRequest, ApprovalResponse, ApprovalResult, HostError, LocationError, LocationResolver,
    PermissionHost, RegistryQuery, RegistryVerdict, SnapLocation, SnapRegistry, SnapRpcHost,
    VirtualFile,
};

/// `endowment:rpc` open to dapps and snaps.
pub fn default_permissions() -> PermissionSet {
    BTreeMap::from([(
        "endowment:rpc".to_string(),
        json!({"dapps": true, "snaps": true}),
    )])
}

pub fn manifest_for(version: &str, source_code: &str, permissions: PermissionSet) -> SnapManifest {
    SnapManifest {
        version: Version::parse(version).unwrap_or_else(|_| Version::new(0, 0, 0)),
        proposed_name: "Mock Snap".to_string(),
        description: None,
        source: ManifestSource {
            shasum: source_shasum(source_code),
            file_path: "dist/bundle.js".to_string(),
        },
        initial_permissions: permissions,
    }
}

/// Permission system backed by a map. Approvals are granted automatically unless told otherwise.
#[derive(Default)]
pub struct MemoryPermissionHost {
    granted: Mutex<HashMap<SnapId, PermissionSet>>,
    globals: Mutex<HashMap<String, Vec<String>>>,
    approvals: Mutex<Vec<ApprovalRequest>>,
    results: Mutex<Vec<(String, ApprovalResult)>>,
    reject: AtomicBool,
    approve_all: AtomicBool,
}

impl MemoryPermissionHost {
    pub fn new() -> Self {
        let host = Self::default();
        host.globals.lock().extend([
            (
                "endowment:network-access".to_string(),
                vec!["fetch".to_string(), "Request".to_string(), "Response".to_string()],
            ),
            ("endowment:webassembly".to_string(), vec!["WebAssembly".to_string()]),
        ]);
        host
    }

    pub fn reject_approvals(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Answer update approvals with every permission the release asks for, held or not.
    pub fn approve_all_requested(&self, all: bool) {
        self.approve_all.store(all, Ordering::SeqCst);
    }

    pub fn granted(&self, snap_id: &SnapId) -> PermissionSet {
        self.granted.lock().get(snap_id).cloned().unwrap_or_default()
    }

    pub fn set_granted(&self, snap_id: &SnapId, permissions: PermissionSet) {
        self.granted.lock().insert(snap_id.clone(), permissions);
    }

    pub fn approvals(&self) -> Vec<ApprovalRequest> {
        self.approvals.lock().clone()
    }

    pub fn results(&self) -> Vec<(String, ApprovalResult)> {
        self.results.lock().clone()
    }
}

#[async_trait::async_trait]
impl PermissionHost for MemoryPermissionHost {
    async fn has_permission(&self, snap_id: &SnapId, name: &str) -> bool {
        self.granted
            .lock()
            .get(snap_id)
            .map(|set| set.contains_key(name))
            .unwrap_or(false)
    }

    async fn granted_permissions(&self, snap_id: &SnapId) -> PermissionSet {
        self.granted(snap_id)
    }

    async fn endowment_globals(&self, _snap_id: &SnapId, permission: &str) -> Vec<String> {
        self.globals
            .lock()
            .get(permission)
            .cloned()
            .unwrap_or_default()
    }

    async fn request_approval(
        &self,
        request: ApprovalRequest,
    ) -> Result<ApprovalResponse, HostError> {
        self.approvals.lock().push(request.clone());
        if self.reject.load(Ordering::SeqCst) {
            return Err(HostError::Rejected);
        }
        // Updates only ask for what is not held yet.
        let permissions = match request.change {
            Some(change) if !self.approve_all.load(Ordering::SeqCst) => change.new_permissions,
            _ => request.permissions,
        };
        Ok(ApprovalResponse {
            permissions,
            request_data: None,
        })
    }

    async fn report_approval_result(&self, approval_id: &str, result: ApprovalResult) {
        self.results.lock().push((approval_id.to_string(), result));
    }

    async fn grant(&self, snap_id: &SnapId, permissions: PermissionSet) -> Result<(), HostError> {
        self.granted
            .lock()
            .entry(snap_id.clone())
            .or_default()
            .extend(permissions);
        Ok(())
    }

    async fn revoke(&self, snap_id: &SnapId, names: &[String]) -> Result<(), HostError> {
        if let Some(set) = self.granted.lock().get_mut(snap_id) {
            for name in names {
                set.remove(name);
            }
        }
        Ok(())
    }

    async fn revoke_all(&self, snap_id: &SnapId) -> Result<(), HostError> {
        self.granted.lock().remove(snap_id);
        Ok(())
    }
}

/// Registry answering from a table keyed by snap id and version.
pub struct MemoryRegistry {
    verdicts: Mutex<HashMap<(SnapId, Version), RegistryVerdict>>,
    fallback: Mutex<RegistryVerdict>,
    checks: AtomicUsize,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            verdicts: Mutex::new(HashMap::new()),
            fallback: Mutex::new(RegistryVerdict::verified()),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, snap_id: &SnapId, version: &str, verdict: RegistryVerdict) {
        let version = Version::parse(version).unwrap_or_else(|_| Version::new(0, 0, 0));
        self.verdicts
            .lock()
            .insert((snap_id.clone(), version), verdict);
    }

    pub fn set_fallback(&self, verdict: RegistryVerdict) {
        *self.fallback.lock() = verdict;
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SnapRegistry for MemoryRegistry {
    async fn check(&self, query: &RegistryQuery) -> RegistryVerdict {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let key = (query.snap_id.clone(), query.version.clone());
        let verdict = self.verdicts.lock().get(&key).cloned();
        verdict.unwrap_or_else(|| self.fallback.lock().clone())
    }
}

#[derive(Debug, Clone)]
struct Package {
    manifest: SnapManifest,
    source_code: String,
}

#[derive(Default)]
struct Counters {
    detects: AtomicUsize,
    manifests: AtomicUsize,
    fetches: AtomicUsize,
}

/// Package source holding every published version in memory. `local:` ids always reload.
#[derive(Default)]
pub struct MemoryLocations {
    packages: Mutex<HashMap<SnapId, Vec<Package>>>,
    counters: Arc<Counters>,
}

impl MemoryLocations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `source_code` as `version` with the default permissions.
    pub fn publish(&self, snap_id: &SnapId, version: &str, source_code: &str) {
        self.publish_with(snap_id, version, source_code, default_permissions());
    }

    pub fn publish_with(
        &self,
        snap_id: &SnapId,
        version: &str,
        source_code: &str,
        permissions: PermissionSet,
    ) {
        self.publish_manifest(snap_id, manifest_for(version, source_code, permissions), source_code);
    }

    /// Publish a manifest as is, checksum included.
    pub fn publish_manifest(&self, snap_id: &SnapId, manifest: SnapManifest, source_code: &str) {
        let mut packages = self.packages.lock();
        let versions = packages.entry(snap_id.clone()).or_default();
        versions.retain(|p| p.manifest.version != manifest.version);
        versions.push(Package {
            manifest,
            source_code: source_code.to_string(),
        });
        versions.sort_by(|a, b| a.manifest.version.cmp(&b.manifest.version));
    }

    pub fn detects(&self) -> usize {
        self.counters.detects.load(Ordering::SeqCst)
    }

    pub fn manifests(&self) -> usize {
        self.counters.manifests.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.counters.fetches.load(Ordering::SeqCst)
    }
}

impl LocationResolver for MemoryLocations {
    /// The newest version inside `range`, or the newest overall so the caller can report the
    /// mismatch.
    fn detect(
        &self,
        snap_id: &SnapId,
        range: &VersionReq,
    ) -> Result<Arc<dyn SnapLocation>, LocationError> {
        self.counters.detects.fetch_add(1, Ordering::SeqCst);
        let packages = self.packages.lock();
        let versions = packages
            .get(snap_id)
            .filter(|versions| !versions.is_empty())
            .ok_or_else(|| LocationError::Unsupported(snap_id.to_string()))?;
        let package = versions
            .iter()
            .rev()
            .find(|p| range.matches(&p.manifest.version))
            .or_else(|| versions.last())
            .cloned()
            .ok_or_else(|| LocationError::NotFound(snap_id.to_string()))?;
        Ok(Arc::new(MemoryLocation {
            package,
            always_reload: snap_id.is_local(),
            counters: self.counters.clone(),
        }))
    }
}

struct MemoryLocation {
    package: Package,
    always_reload: bool,
    counters: Arc<Counters>,
}

#[async_trait::async_trait]
impl SnapLocation for MemoryLocation {
    async fn manifest(&self) -> Result<VirtualFile<SnapManifest>, LocationError> {
        self.counters.manifests.fetch_add(1, Ordering::SeqCst);
        Ok(VirtualFile {
            path: "snap.manifest.json".to_string(),
            result: self.package.manifest.clone(),
        })
    }

    async fn fetch(&self, path: &str) -> Result<VirtualFile<String>, LocationError> {
        self.counters.fetches.fetch_add(1, Ordering::SeqCst);
        if path != self.package.manifest.source.file_path {
            return Err(LocationError::NotFound(path.to_string()));
        }
        Ok(VirtualFile {
            path: path.to_string(),
            result: self.package.source_code.clone(),
        })
    }

    fn should_always_reload(&self) -> bool {
        self.always_reload
    }
}

/// Answers snap-issued requests from a fixed table of method results.
#[derive(Default)]
pub struct StaticRpcHost {
    results: HashMap<String, Value>,
    calls: AtomicUsize,
}

impl StaticRpcHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, method: &str, result: Value) -> Self {
        self.results.insert(method.to_string(), result);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SnapRpcHost for StaticRpcHost {
    async fn handle(&self, _snap_id: &SnapId, request: RpcRequest) -> Result<Value, RpcErrorObject> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.results
            .get(&request.method)
            .cloned()
            .ok_or_else(|| RpcErrorObject::method_not_found(&request.method))
    }
}
