//! On-disk request bundles under `<state-root>/requests/<bundle-id>/`.
//!
//! A bundle materializes one flow: `request.http` holds the header block
//! with a placeholder where the body sits, `body.bin` the raw body bytes,
//! `request.meta.json` the metadata. Replaying with `export` set adds
//! `response.http` and `response.body.bin`. Bundles are never auto-deleted.

use crate::error::{Result, ServiceError};
use crate::ids;
use crate::rewrite::http::split_headers_body;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

const BODY_PLACEHOLDER: &[u8] = b"<body written to body.bin>\n";

#[derive(Debug, Serialize)]
struct BundleMeta<'a> {
    flow_id: &'a str,
    method: &'a str,
    url: &'a str,
    created_at: DateTime<Utc>,
}

pub struct BundleStore {
    root: PathBuf,
}

impl BundleStore {
    pub fn new(root: &Path) -> Self {
        BundleStore {
            root: root.to_path_buf(),
        }
    }

    pub fn bundle_dir(&self, bundle_id: &str) -> PathBuf {
        self.root.join(bundle_id)
    }

    /// Write the request side of a bundle and return (bundle-id, dir path).
    pub fn write_request(
        &self,
        flow_id: &str,
        raw_request: &[u8],
        method: &str,
        url: &str,
    ) -> Result<(String, PathBuf)> {
        let bundle_id = ids::generate(ids::DEFAULT_LENGTH);
        let dir = self.bundle_dir(&bundle_id);
        DirBuilder::new().recursive(true).mode(0o700).create(&dir)?;

        let (head, body) = split_headers_body(raw_request);
        let mut request_file = head.to_vec();
        if !body.is_empty() {
            request_file.extend_from_slice(BODY_PLACEHOLDER);
        }
        write_private(&dir.join("request.http"), &request_file)?;
        write_private(&dir.join("body.bin"), body)?;

        let meta = BundleMeta {
            flow_id,
            method,
            url,
            created_at: Utc::now(),
        };
        write_private(
            &dir.join("request.meta.json"),
            &serde_json::to_vec_pretty(&meta)?,
        )?;

        Ok((bundle_id, dir))
    }

    /// Attach a replay result to an existing bundle.
    pub fn write_response(&self, bundle_id: &str, headers: &[u8], body: &[u8]) -> Result<()> {
        let dir = self.bundle_dir(bundle_id);
        if !dir.is_dir() {
            return Err(ServiceError::NotFound(format!(
                "bundle not found: {bundle_id}"
            )));
        }
        write_private(&dir.join("response.http"), headers)?;
        write_private(&dir.join("response.body.bin"), body)?;
        Ok(())
    }
}

fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    Ok(())
}
