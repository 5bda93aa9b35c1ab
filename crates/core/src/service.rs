//! Request orchestration: validate, resolve inputs, plan, admit, await.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{SourceMedia, TransformCatalog, TransformRequest};
use crate::error::{EditError, EngineError};
use crate::probe::{MediaInfo, MediaProber};
use crate::queue::AdmissionQueue;
use crate::store::{self, Artifact, ArtifactKind, ArtifactStore};

/// Transform inputs may be fresh uploads or earlier outputs.
const INPUT_KINDS: [ArtifactKind; 2] = [ArtifactKind::Upload, ArtifactKind::Processed];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformOutcome {
    pub filename: String,
    pub job_id: Uuid,
    pub size: u64,
}

#[derive(Clone)]
pub struct EditService {
    store: ArtifactStore,
    catalog: Arc<TransformCatalog>,
    prober: Arc<dyn MediaProber>,
    queue: AdmissionQueue,
    max_upload_bytes: u64,
}

impl EditService {
    pub fn new(
        store: ArtifactStore,
        catalog: TransformCatalog,
        prober: Arc<dyn MediaProber>,
        queue: AdmissionQueue,
        max_upload_bytes: u64,
    ) -> Self {
        Self {
            store,
            catalog: Arc::new(catalog),
            prober,
            queue,
            max_upload_bytes,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn queue(&self) -> &AdmissionQueue {
        &self.queue
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    /// Store an uploaded body after checking its declared content type.
    pub async fn ingest<S, E>(
        &self,
        original_name: Option<&str>,
        content_type: &str,
        body: S,
    ) -> Result<Artifact, EditError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: fmt::Display,
    {
        if !store::is_media_content_type(content_type) {
            return Err(EditError::validation(format!(
                "only video or audio files are accepted, got {content_type:?}"
            )));
        }
        let extension = store::upload_extension(original_name, content_type);
        let artifact = self
            .store
            .put_stream(ArtifactKind::Upload, &extension, body, self.max_upload_bytes)
            .await?;
        info!(
            artifact = %artifact.name,
            original = original_name.unwrap_or_default(),
            size = artifact.size,
            "Upload stored"
        );
        Ok(artifact)
    }

    /// Probe for display purposes; failures degrade to zeroed metadata.
    pub async fn media_info(&self, path: &Path) -> MediaInfo {
        match self.prober.probe(path).await {
            Ok(info) => info,
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "Probe failed; reporting empty metadata");
                MediaInfo::default()
            }
        }
    }

    /// Run one edit to completion. Rejected requests never reach the queue.
    pub async fn transform(&self, request: TransformRequest) -> Result<TransformOutcome, EditError> {
        request.validate()?;

        let mut sources = Vec::with_capacity(request.inputs.len());
        for name in &request.inputs {
            let (_, path) = self.store.resolve_any(name, &INPUT_KINDS).await?;
            sources.push(SourceMedia { path, info: None });
        }

        if request.operation.needs_probe() {
            for source in &mut sources {
                let info = self.prober.probe(&source.path).await.map_err(|err| {
                    EngineError::Probe(format!("{}: {err:#}", source.path.display()))
                })?;
                source.info = Some(info);
            }
        }

        let plan = self.catalog.build(&request.operation, &sources)?;
        let operation = plan.operation;
        let (filename, output) = self.store.allocate(ArtifactKind::Processed, plan.extension);

        let handle = self.queue.submit(plan, output.clone());
        let job_id = handle.id();
        info!(%job_id, operation, output = %filename, "Transform admitted");

        if let Err(err) = handle.wait().await {
            store::discard(&output).await;
            return Err(err.into());
        }

        let artifact = Artifact::inspect(ArtifactKind::Processed, &output).await?;
        Ok(TransformOutcome {
            filename,
            job_id,
            size: artifact.size,
        })
    }
}
