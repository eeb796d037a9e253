//! Template upload from an OVA archive or an extracted OVF descriptor.

use futures::{StreamExt, TryStreamExt};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::vsphere::client::TaskRequest;
use crate::vsphere::mo::{Datacenter, ManagedObjectReference};
use crate::vsphere::specs::{FileItem, ImportSpecParams};
use crate::vsphere::VsphereVm;

/// Content type of streamed VMDK uploads.
pub const STREAM_VMDK_CONTENT_TYPE: &str = "application/x-vnd.vmware-streamVmdk";

/// How often upload progress is reported to keep the lease alive.
pub const LEASE_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Unpack an OVA (tar) archive into `dir`, flattening entry paths.
///
/// Returns the path of the first `.ovf` descriptor found.
pub fn extract_ova<R: Read>(dir: &Path, reader: R) -> Result<PathBuf> {
    let mut archive = tar::Archive::new(reader);
    let mut descriptor = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_dir() {
            continue;
        }
        let path = entry.path()?.into_owned();
        let Some(file_name) = path.file_name() else {
            continue;
        };

        let target = dir.join(file_name);
        entry.unpack(&target)?;
        debug!(file = %target.display(), "Extracted archive entry");

        if descriptor.is_none() && target.extension().is_some_and(|e| e == "ovf") {
            descriptor = Some(target);
        }
    }

    descriptor.ok_or_else(|| HypervisorError::InvalidConfig("no ovf file found in the archive".to_string()))
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Percentage of `sent` over `total`, clamped to 0..=100.
fn percent(sent: u64, total: u64) -> i32 {
    if total == 0 {
        return 0;
    }
    ((sent.min(total) * 100) / total) as i32
}

impl VsphereVm {
    /// Name of the template for `datastore`.
    ///
    /// In local template mode each datastore carries its own copy named
    /// `<template>-<datastore>`.
    pub fn template_name(&self, datastore: Option<&str>) -> String {
        match datastore {
            Some(ds) if self.spec.use_local_templates && !ds.is_empty() => {
                format!("{}-{}", self.spec.template.name, ds)
            }
            _ => self.spec.template.name.clone(),
        }
    }

    /// Fetch an OVA (http(s) URL or local path) and unpack it into `dir`.
    #[instrument(skip(self, dir))]
    pub async fn download_ova(&self, dir: &Path, location: &str) -> Result<PathBuf> {
        let archive = if is_remote(location) {
            let target = dir.join("template.ova");
            self.fetch(location, &target).await?;
            target
        } else {
            PathBuf::from(location)
        };

        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&archive)?;
            extract_ova(&dir, std::io::BufReader::new(file))
        })
        .await
        .map_err(|e| HypervisorError::Internal(format!("archive extraction panicked: {}", e)))?
    }

    async fn fetch(&self, url: &str, target: &Path) -> Result<()> {
        info!(url = %url, "Downloading OVA");
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(self.session.insecure())
            .build()
            .map_err(|e| HypervisorError::ClientFailed(e.to_string()))?;

        let mut response = client
            .get(url)
            .send()
            .await
            .map_err(|e| HypervisorError::Backend(format!("error downloading {}: {}", url, e)))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(HypervisorError::BadResponse {
                status: status.as_u16(),
                body,
            });
        }

        let mut file = tokio::fs::File::create(target).await?;
        let mut downloaded: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| HypervisorError::Backend(format!("error reading {}: {}", url, e)))?
        {
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(bytes = downloaded, "OVA downloaded");
        Ok(())
    }

    /// Import the configured image as a template on `datastore`.
    ///
    /// With linked clones the imported VM gets a `snapshot-<template>`
    /// snapshot instead of being marked as a template.
    #[instrument(skip(self, dc), fields(vm_name = %self.spec.name))]
    pub async fn upload_template(&mut self, dc: &Datacenter, datastore: &str) -> Result<()> {
        if datastore.is_empty() {
            return Err(HypervisorError::InvalidConfig(
                "a datastore is required to upload a template".to_string(),
            ));
        }
        self.datastore = Some(datastore.to_string());
        let name = self.template_name(Some(datastore));
        info!(template = %name, datastore, "Uploading template");

        let workdir = tempfile::tempdir()?;
        // An OVA location takes precedence over an extracted descriptor.
        let descriptor_path = match (&self.spec.ova_path_url, &self.spec.ovf_path) {
            (Some(ova), _) => self.download_ova(workdir.path(), ova).await?,
            (None, Some(ovf)) => PathBuf::from(ovf),
            (None, None) => {
                return Err(HypervisorError::InvalidConfig(
                    "no ova or ovf source configured for the template".to_string(),
                ))
            }
        };
        let descriptor = tokio::fs::read_to_string(&descriptor_path).await?;

        let location = self.resolve_location(dc).await?;
        let datastore_ref = self.find_datastore(dc, datastore).await?;
        let params = ImportSpecParams {
            host_system: location.host.clone(),
            entity_name: name.clone(),
            disk_provisioning: "thin".to_string(),
        };

        let mut result = self
            .client()
            .create_import_spec(&descriptor, &location.resource_pool, &datastore_ref, &params)
            .await
            .map_err(|e| e.context("error creating import spec"))?;
        if !result.error.is_empty() {
            return Err(HypervisorError::Backend(format!(
                "import spec rejected: {}",
                result.error.join("; ")
            )));
        }
        for warning in &result.warning {
            warn!(warning = %warning, "Import spec warning");
        }
        result.import_spec.reset_unit_numbers();

        let lease = self
            .client()
            .import_vapp(
                &location.resource_pool,
                &result.import_spec,
                &dc.vm_folder,
                location.host.as_ref(),
            )
            .await
            .map_err(|e| e.context("error importing vapp"))?;

        let base = descriptor_path.parent().unwrap_or_else(|| Path::new("."));
        if let Err(e) = self.upload_disks(&lease, &result.file_item, base).await {
            if let Err(abort) = self.client().lease_abort(&lease, &e.to_string()).await {
                warn!(error = %abort, "Failed to abort import lease");
            }
            return Err(e.context("error uploading the ovf template"));
        }
        self.client()
            .lease_complete(&lease)
            .await
            .map_err(|e| e.context("error completing import lease"))?;

        let template = self
            .find_vm(&self.template_filter(Some(datastore)))
            .await
            .map_err(|e| e.context("error retrieving uploaded template"))?;

        if self.spec.use_linked_clones {
            self.session
                .run_task(TaskRequest::CreateSnapshot {
                    vm: template.reference.clone(),
                    name: format!("snapshot-{}", name),
                    description: String::new(),
                    memory: false,
                    quiesce: false,
                })
                .await
                .map_err(|e| e.context("error creating template snapshot"))?;
        } else {
            self.client()
                .mark_as_template(&template.reference)
                .await
                .map_err(|e| e.context("error marking vm as template"))?;
        }

        info!(template = %name, "Template uploaded");
        Ok(())
    }

    /// Stream the descriptor's disk image to the lease device URL,
    /// reporting progress while the upload runs.
    async fn upload_disks(&self, lease: &ManagedObjectReference, items: &[FileItem], base: &Path) -> Result<()> {
        let info = self
            .session
            .wait("waiting for import lease", None, self.client().lease_wait(lease))
            .await?;
        let device = info
            .device_url
            .first()
            .ok_or_else(|| HypervisorError::Backend("import lease has no device urls".to_string()))?;
        let item = items
            .first()
            .ok_or_else(|| HypervisorError::Backend("import spec has no files to upload".to_string()))?;

        let url = device.url.replacen('*', self.session.host(), 1);
        let path = base.join(&item.path);
        let file = tokio::fs::File::open(&path).await?;
        let size = file.metadata().await?.len();

        let sent = Arc::new(AtomicU64::new(0));
        let counter = sent.clone();
        let body = ReaderStream::new(file)
            .inspect_ok(move |chunk| {
                counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            })
            .boxed();

        info!(file = %path.display(), size, url = %url, "Uploading disk image");
        let upload = self
            .session
            .uploader()
            .upload(&url, STREAM_VMDK_CONTENT_TYPE, size, body);
        let keepalive = async {
            let mut ticker = tokio::time::interval(LEASE_PROGRESS_INTERVAL);
            loop {
                ticker.tick().await;
                let progress = percent(sent.load(Ordering::Relaxed), size);
                if let Err(e) = self.client().lease_progress(lease, progress).await {
                    warn!(error = %e, "Failed to report lease progress");
                }
            }
        };

        self.session
            .wait("uploading disk image", None, async {
                tokio::select! {
                    result = upload => result,
                    _ = keepalive => Err(HypervisorError::Internal("lease keep-alive stopped".to_string())),
                }
            })
            .await?;

        debug!(bytes = sent.load(Ordering::Relaxed), "Disk image uploaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_extract_ova_finds_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let data = archive(&[
            ("ubuntu/ubuntu.ovf", b"<Envelope/>".as_slice()),
            ("ubuntu/ubuntu-disk1.vmdk", b"disk".as_slice()),
        ]);

        let ovf = extract_ova(dir.path(), data.as_slice()).unwrap();
        assert_eq!(ovf, dir.path().join("ubuntu.ovf"));
        assert!(dir.path().join("ubuntu-disk1.vmdk").exists());
    }

    #[test]
    fn test_extract_ova_without_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let data = archive(&[("disk.vmdk", b"disk".as_slice())]);

        let err = extract_ova(dir.path(), data.as_slice()).unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidConfig(_)));
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(50, 200), 25);
        assert_eq!(percent(300, 200), 100);
    }
}
