//! vSphere backend.
//!
//! A [`Session`] wraps the backend collaborator ([`VimClient`]) together
//! with the session's cancellation token and the shared customization spec
//! cache. A [`VsphereVm`] is the per-VM handle every operation works on:
//!
//! ```text
//!            VsphereVm (VmSpec + cached datastore)
//!                 │
//!   ┌─────────────┼───────────────┬──────────────┐
//!   ▼             ▼               ▼              ▼
//! lifecycle     clone          template      inventory ──► question
//!   │             │               │              ▲
//!   └─────────────┴──► placement ─┴──────────────┘
//!                         │
//!                         ▼
//!                 Session ──► VimClient
//! ```

pub mod client;
pub mod clone;
pub mod customization;
pub mod device;
pub mod inventory;
pub mod lifecycle;
pub mod mo;
pub mod mock;
pub mod placement;
pub mod question;
pub mod specs;
pub mod task;
pub mod template;

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::config::{ConnectionConfig, VmSpec};
use crate::error::{HypervisorError, Result};
use crate::traits::{ProviderCapabilities, VirtualMachine};
use crate::types::{Template, VmState};

pub use client::{DiskUploader, HttpUploader, TaskRequest, VimClient};
pub use customization::CustomSpecCache;
pub use inventory::{split_path, MobSearch, VmListing};
pub use placement::Location;

/// Connection to one management endpoint.
///
/// Cloning a session shares the client, the cancellation token and the
/// customization spec cache.
#[derive(Clone)]
pub struct Session {
    client: Arc<dyn VimClient>,
    uploader: Arc<dyn DiskUploader>,
    sdk_url: reqwest::Url,
    host: String,
    insecure: bool,
    cancel: CancellationToken,
    custom_specs: Arc<CustomSpecCache>,
}

impl Session {
    /// Set up a session against `https://{host}/sdk`.
    ///
    /// `connector` builds the backend client from the SDK URL (credentials
    /// included as user info) and the insecure flag.
    #[instrument(skip(config, connector), fields(host = %config.host))]
    pub fn connect<F>(config: &ConnectionConfig, connector: F) -> Result<Self>
    where
        F: FnOnce(&reqwest::Url, bool) -> Result<Arc<dyn VimClient>>,
    {
        let uri = format!("https://{}/sdk", config.host);
        if config.host.trim().is_empty() {
            return Err(HypervisorError::ParsingUrl {
                url: uri,
                reason: "empty host".to_string(),
            });
        }
        let mut sdk_url = reqwest::Url::parse(&uri).map_err(|e| HypervisorError::ParsingUrl {
            url: uri.clone(),
            reason: e.to_string(),
        })?;
        sdk_url
            .set_username(&config.username)
            .and_then(|_| sdk_url.set_password(Some(&config.password)))
            .map_err(|_| HypervisorError::ParsingUrl {
                url: uri.clone(),
                reason: "cannot carry credentials".to_string(),
            })?;

        let client = connector(&sdk_url, config.insecure)
            .map_err(|e| HypervisorError::ClientFailed(e.to_string()))?;
        let uploader = HttpUploader::new(config.insecure)?;

        info!("Session established");

        Ok(Self {
            client,
            uploader: Arc::new(uploader),
            sdk_url,
            host: config.host.clone(),
            insecure: config.insecure,
            cancel: CancellationToken::new(),
            custom_specs: Arc::new(CustomSpecCache::new()),
        })
    }

    /// Replace the disk uploader.
    pub fn with_uploader(mut self, uploader: Arc<dyn DiskUploader>) -> Self {
        self.uploader = uploader;
        self
    }

    /// Share a customization spec cache with other sessions.
    pub fn with_custom_specs(mut self, cache: Arc<CustomSpecCache>) -> Self {
        self.custom_specs = cache;
        self
    }

    pub fn client(&self) -> &dyn VimClient {
        self.client.as_ref()
    }

    pub fn sdk_url(&self) -> &reqwest::Url {
        &self.sdk_url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn insecure(&self) -> bool {
        self.insecure
    }

    /// Token cancelled when the session is closed.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every wait running on this session.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn uploader(&self) -> &dyn DiskUploader {
        self.uploader.as_ref()
    }

    pub(crate) fn custom_specs(&self) -> &CustomSpecCache {
        &self.custom_specs
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("insecure", &self.insecure)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// How a VM or template is looked up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    /// Inventory path below the datacenter VM folder
    pub name: String,
    /// Instance UUID; takes precedence over the path
    pub instance_uuid: Option<String>,
    /// Scope a UUID search to the configured datacenter
    pub search_in_dc: bool,
}

impl SearchFilter {
    /// VMs are searched within the datacenter.
    pub fn vm(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_uuid: None,
            search_in_dc: true,
        }
    }

    /// Templates are searched across the whole inventory.
    pub fn template(template: &Template) -> Self {
        Self {
            name: template.name.clone(),
            instance_uuid: template.instance_uuid.clone().filter(|u| !u.is_empty()),
            search_in_dc: false,
        }
    }
}

/// Handle to one VM on a vSphere endpoint.
#[derive(Debug)]
pub struct VsphereVm {
    session: Session,
    spec: VmSpec,
    /// Datastore chosen by the last clone or upload
    datastore: Option<String>,
}

impl VsphereVm {
    pub fn new(session: Session, spec: VmSpec) -> Self {
        Self {
            session,
            spec,
            datastore: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn spec(&self) -> &VmSpec {
        &self.spec
    }

    pub fn spec_mut(&mut self) -> &mut VmSpec {
        &mut self.spec
    }

    /// Datastore chosen by the last clone or upload.
    pub fn datastore(&self) -> Option<&str> {
        self.datastore.as_deref()
    }

    pub(crate) fn client(&self) -> &dyn VimClient {
        self.session.client()
    }

    fn template_filter(&self, datastore: Option<&str>) -> SearchFilter {
        let mut template = self.spec.template.clone();
        template.name = self.template_name(datastore);
        SearchFilter::template(&template)
    }

    /// Make sure the template exists, uploading it from the configured
    /// image when it does not.
    async fn ensure_templates(&mut self, dc: &mo::Datacenter) -> Result<()> {
        if self.spec.ova_path_url.is_none() && self.spec.ovf_path.is_none() {
            return Ok(());
        }

        if self.spec.use_local_templates {
            for datastore in self.spec.datastores.clone() {
                if !self.exists(&self.template_filter(Some(&datastore))).await? {
                    self.upload_template(dc, &datastore).await?;
                }
            }
            return Ok(());
        }

        if !self.exists(&self.template_filter(None)).await? {
            let datastore = placement::choose_random(&self.spec.datastores)
                .cloned()
                .unwrap_or_default();
            self.upload_template(dc, &datastore).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl VirtualMachine for VsphereVm {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            name: "vsphere".to_string(),
            supports_linked_clones: true,
            supports_static_ip: true,
            supports_guest_operations: true,
            supports_templates: true,
        }
    }

    #[instrument(skip(self), fields(vm_name = %self.spec.name))]
    async fn provision(&mut self) -> Result<()> {
        let timer = vmforge_common::TimedOperation::start("provision", &self.spec.name);
        let dc = self.datacenter().await?;
        self.ensure_templates(&dc).await?;
        self.clone_from_template(&dc).await?;
        timer.finish();
        Ok(())
    }

    async fn state(&self) -> Result<VmState> {
        Ok(self.power_state().await?.into())
    }

    async fn start(&mut self) -> Result<()> {
        VsphereVm::start(self).await
    }

    async fn halt(&mut self) -> Result<()> {
        VsphereVm::halt(self).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        VsphereVm::shutdown(self).await
    }

    async fn restart(&mut self) -> Result<()> {
        VsphereVm::restart(self).await
    }

    async fn reset(&mut self) -> Result<()> {
        VsphereVm::reset(self).await
    }

    async fn destroy(&mut self) -> Result<()> {
        VsphereVm::destroy(self).await
    }

    async fn ips(&self) -> Result<Vec<String>> {
        VsphereVm::ips(self).await
    }
}
