//! Backend collaborator interface.
//!
//! Everything this library needs from the management endpoint goes through
//! [`VimClient`]: property retrieval, task submission and completion, import
//! leases, property-change subscriptions and the handful of managers
//! (search index, customization specs, custom fields). The transport behind
//! it is not part of this crate; [`crate::vsphere::mock::MockVimClient`] is
//! the in-memory implementation.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{HypervisorError, Result};
use crate::vsphere::mo::{ManagedObjectReference, ObjectContent, TaskInfo};
use crate::vsphere::specs::{
    CloneSpec, ConfigSpec, CustomizationSpecItem, ImportSpec, ImportSpecParams, ImportSpecResult,
    LeaseInfo,
};

/// Stream of values of one watched property; the first item is the
/// current value.
pub type PropertyStream = BoxStream<'static, Result<Value>>;

/// Stream of bytes uploaded to a lease device URL.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// A mutating operation that returns a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskRequest {
    Clone {
        vm: ManagedObjectReference,
        folder: ManagedObjectReference,
        name: String,
        spec: CloneSpec,
    },
    PowerOn {
        vm: ManagedObjectReference,
    },
    PowerOff {
        vm: ManagedObjectReference,
    },
    Reset {
        vm: ManagedObjectReference,
    },
    Reconfigure {
        vm: ManagedObjectReference,
        spec: ConfigSpec,
    },
    CreateSnapshot {
        vm: ManagedObjectReference,
        name: String,
        description: String,
        memory: bool,
        quiesce: bool,
    },
    Destroy {
        vm: ManagedObjectReference,
    },
}

impl TaskRequest {
    /// Operation name used in logs and errors.
    pub fn operation(&self) -> &'static str {
        match self {
            TaskRequest::Clone { .. } => "clone",
            TaskRequest::PowerOn { .. } => "power on",
            TaskRequest::PowerOff { .. } => "power off",
            TaskRequest::Reset { .. } => "reset",
            TaskRequest::Reconfigure { .. } => "reconfigure",
            TaskRequest::CreateSnapshot { .. } => "create snapshot",
            TaskRequest::Destroy { .. } => "destroy",
        }
    }

    /// The entity the task runs against.
    pub fn target(&self) -> &ManagedObjectReference {
        match self {
            TaskRequest::Clone { vm, .. }
            | TaskRequest::PowerOn { vm }
            | TaskRequest::PowerOff { vm }
            | TaskRequest::Reset { vm }
            | TaskRequest::Reconfigure { vm, .. }
            | TaskRequest::CreateSnapshot { vm, .. }
            | TaskRequest::Destroy { vm } => vm,
        }
    }
}

/// Management endpoint operations.
///
/// Reads are idempotent. Each mutating call is submitted at most once;
/// retries are the caller's decision.
#[async_trait]
pub trait VimClient: Send + Sync {
    // =========================================================================
    // Properties
    // =========================================================================

    /// Retrieve `properties` of every object in `objects`.
    ///
    /// A vanished object yields [`HypervisorError::ObjectDeleted`].
    async fn retrieve(
        &self,
        objects: &[ManagedObjectReference],
        properties: &[&str],
    ) -> Result<Vec<ObjectContent>>;

    /// Subscribe to changes of one property of one object.
    async fn watch(&self, object: &ManagedObjectReference, property: &str) -> Result<PropertyStream>;

    // =========================================================================
    // Finder / search index
    // =========================================================================

    /// All datacenters in the inventory.
    async fn datacenters(&self) -> Result<Vec<ManagedObjectReference>>;

    /// Resource pools matching a finder path inside `datacenter`,
    /// e.g. `*/Resources/*/*`.
    async fn resource_pools(
        &self,
        datacenter: &ManagedObjectReference,
        path: &str,
    ) -> Result<Vec<ManagedObjectReference>>;

    /// Look up an entity by instance UUID, optionally scoped to one datacenter.
    async fn find_by_instance_uuid(
        &self,
        datacenter: Option<&ManagedObjectReference>,
        uuid: &str,
    ) -> Result<Option<ManagedObjectReference>>;

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Submit a mutating operation, returning its task.
    async fn submit(&self, request: TaskRequest) -> Result<ManagedObjectReference>;

    /// Block until the task leaves the queued/running states.
    async fn wait_for_task(&self, task: &ManagedObjectReference) -> Result<TaskInfo>;

    // =========================================================================
    // Guest operations (no task)
    // =========================================================================

    async fn shutdown_guest(&self, vm: &ManagedObjectReference) -> Result<()>;

    async fn reboot_guest(&self, vm: &ManagedObjectReference) -> Result<()>;

    async fn mark_as_template(&self, vm: &ManagedObjectReference) -> Result<()>;

    /// Answer a pending question with a choice key.
    async fn answer_vm(&self, vm: &ManagedObjectReference, question_id: &str, answer: &str) -> Result<()>;

    // =========================================================================
    // OVF import
    // =========================================================================

    async fn create_import_spec(
        &self,
        ovf_descriptor: &str,
        pool: &ManagedObjectReference,
        datastore: &ManagedObjectReference,
        params: &ImportSpecParams,
    ) -> Result<ImportSpecResult>;

    /// Start an import into `pool`, returning the lease.
    async fn import_vapp(
        &self,
        pool: &ManagedObjectReference,
        spec: &ImportSpec,
        folder: &ManagedObjectReference,
        host: Option<&ManagedObjectReference>,
    ) -> Result<ManagedObjectReference>;

    /// Block until the lease is ready for upload.
    async fn lease_wait(&self, lease: &ManagedObjectReference) -> Result<LeaseInfo>;

    /// Report upload progress; keeps the lease alive.
    async fn lease_progress(&self, lease: &ManagedObjectReference, percent: i32) -> Result<()>;

    async fn lease_complete(&self, lease: &ManagedObjectReference) -> Result<()>;

    async fn lease_abort(&self, lease: &ManagedObjectReference, reason: &str) -> Result<()>;

    // =========================================================================
    // Customization specs
    // =========================================================================

    async fn customization_spec_exists(&self, name: &str) -> Result<bool>;

    async fn create_customization_spec(&self, item: CustomizationSpecItem) -> Result<()>;

    async fn customization_spec(&self, name: &str) -> Result<CustomizationSpecItem>;

    // =========================================================================
    // Custom fields
    // =========================================================================

    /// Key of the custom field named `name`, if defined.
    async fn custom_field_key(&self, name: &str) -> Result<Option<i32>>;

    /// Define a custom field for entities of type `kind`, returning its key.
    async fn add_custom_field(&self, name: &str, kind: &str) -> Result<i32>;

    async fn set_custom_field(&self, entity: &ManagedObjectReference, key: i32, value: &str) -> Result<()>;
}

/// Uploads a disk image to a lease device URL.
#[async_trait]
pub trait DiskUploader: Send + Sync {
    async fn upload(&self, url: &str, content_type: &str, length: u64, body: ByteStream) -> Result<()>;
}

/// Uploads over HTTPS with `reqwest`.
pub struct HttpUploader {
    client: reqwest::Client,
}

impl HttpUploader {
    pub fn new(insecure: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(|e| HypervisorError::ClientFailed(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DiskUploader for HttpUploader {
    async fn upload(&self, url: &str, content_type: &str, length: u64, body: ByteStream) -> Result<()> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONNECTION, "Keep-Alive")
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| HypervisorError::Backend(format!("upload to {} failed: {}", url, e)))?;

        let status = response.status();
        if status != reqwest::StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            return Err(HypervisorError::BadResponse {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

// =============================================================================
// TYPED RETRIEVAL
// =============================================================================

/// Turn a projected property set into a nested JSON object.
///
/// Dotted paths such as `snapshot.currentSnapshot` become nested objects.
pub fn nest_properties(properties: Map<String, Value>) -> Value {
    let mut root = Map::new();
    for (path, value) in properties {
        let segments: Vec<&str> = path.split('.').collect();
        insert_path(&mut root, &segments, value);
    }
    Value::Object(root)
}

fn insert_path(node: &mut Map<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [leaf] => {
            node.insert(leaf.to_string(), value);
        }
        [head, rest @ ..] => {
            let entry = node
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child) = entry {
                insert_path(child, rest, value);
            } else {
                let mut child = Map::new();
                insert_path(&mut child, rest, value);
                *entry = Value::Object(child);
            }
        }
    }
}

impl ObjectContent {
    /// Deserialize into a typed view.
    pub fn into_view<T: DeserializeOwned>(self) -> Result<T> {
        let object = self.obj.to_string();
        serde_json::from_value(nest_properties(self.properties)).map_err(|e| {
            HypervisorError::PropertyRetrieval {
                object,
                properties: Vec::new(),
                reason: e.to_string(),
            }
        })
    }
}

fn retrieval_error(
    object: &ManagedObjectReference,
    properties: &[&str],
    err: HypervisorError,
) -> HypervisorError {
    match err {
        HypervisorError::ObjectDeleted(_) | HypervisorError::Cancelled(_) => err,
        other => HypervisorError::PropertyRetrieval {
            object: object.to_string(),
            properties: properties.iter().map(|p| p.to_string()).collect(),
            reason: other.to_string(),
        },
    }
}

/// Retrieve one object's properties as a typed view.
pub async fn retrieve_one<T: DeserializeOwned>(
    client: &dyn VimClient,
    object: &ManagedObjectReference,
    properties: &[&str],
) -> Result<T> {
    let mut contents = client
        .retrieve(std::slice::from_ref(object), properties)
        .await
        .map_err(|e| retrieval_error(object, properties, e))?;
    let content = contents.pop().ok_or_else(|| HypervisorError::PropertyRetrieval {
        object: object.to_string(),
        properties: properties.iter().map(|p| p.to_string()).collect(),
        reason: "no content returned".to_string(),
    })?;
    content.into_view()
}

/// Retrieve several objects' properties as typed views, in request order.
pub async fn retrieve_many<T: DeserializeOwned>(
    client: &dyn VimClient,
    objects: &[ManagedObjectReference],
    properties: &[&str],
) -> Result<Vec<T>> {
    if objects.is_empty() {
        return Ok(Vec::new());
    }
    let contents = client.retrieve(objects, properties).await.map_err(|e| match objects {
        [first, ..] => retrieval_error(first, properties, e),
        [] => e,
    })?;
    contents.into_iter().map(ObjectContent::into_view).collect()
}
