/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Mappings file.
//!
//! Line one is the format version. Version 2 follows it with a JSON header
//! naming the features a reader must understand; every remaining line is
//! one JSON mapping:
//!
//! ```text
//! 2
//! {"RequiredFeatures":["Epoch","PerClient"],"Epoch":0}
//! {"Client":"10.0.0.1","LHS":"a.com","RHS":"1.2.3.4","Expiry":"2025-01-01T00:01:00Z","Type":"ip"}
//! ```
//!
//! Version 1 files have no header and may omit `Client`.

use crate::core::error::{Result, StoreError};
use crate::store::ClientKey;
use crate::store::cache::StoreState;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const FEATURE_EPOCH: &str = "Epoch";
const FEATURE_PER_CLIENT: &str = "PerClient";
const SUPPORTED_FEATURES: [&str; 2] = [FEATURE_EPOCH, FEATURE_PER_CLIENT];

const TYPE_IP: &str = "ip";
const TYPE_NAME: &str = "name";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FileHeader {
    #[serde(default)]
    required_features: Option<Vec<String>>,
    #[serde(default)]
    epoch: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MappingLine {
    #[serde(default)]
    client: String,
    #[serde(rename = "LHS")]
    lhs: String,
    #[serde(rename = "RHS")]
    rhs: String,
    expiry: String,
    #[serde(rename = "Type")]
    kind: String,
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

impl StoreState {
    /// Load mappings saved by a previous run. Returns how many were restored.
    pub(crate) fn read_mappings(&mut self, path: &Path) -> Result<usize> {
        self.reading_mappings = true;
        let result = self.read_mappings_file(path);
        self.reading_mappings = false;
        result
    }

    fn read_mappings_file(&mut self, path: &Path) -> Result<usize> {
        let file = File::open(path)?;
        let mut lines = BufReader::new(file).lines();

        let Some(version) = lines.next() else {
            return Ok(0);
        };
        match version?.trim() {
            "1" => {
                info!("Read mappings in v1 format");
                self.read_mapping_lines(lines)
            }
            "2" => {
                info!("Read mappings in v2 format");
                self.read_v2(lines)
            }
            other => Err(StoreError::persist(format!(
                "unrecognised format version: {other}"
            ))),
        }
    }

    fn read_v2(&mut self, mut lines: Lines<BufReader<File>>) -> Result<usize> {
        let header_line = lines
            .next()
            .ok_or_else(|| StoreError::persist("failed to read v2 file header"))??;
        let header: FileHeader = serde_json::from_str(&header_line).map_err(|e| {
            StoreError::persist(format!("failed to parse v2 file header {header_line:?}: {e}"))
        })?;
        debug!(?header, "decoded v2 file header");

        let missing: Vec<&String> = header
            .required_features
            .iter()
            .flatten()
            .filter(|feature| !SUPPORTED_FEATURES.contains(&feature.as_str()))
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::persist(format!(
                "v2 file requires unsupported features {missing:?}"
            )));
        }

        if header.epoch != self.epoch {
            info!(
                "Ignoring old DNS mappings because epoch changed from {} to {}",
                header.epoch, self.epoch
            );
            return Ok(0);
        }
        self.read_mapping_lines(lines)
    }

    fn read_mapping_lines(&mut self, lines: Lines<BufReader<File>>) -> Result<usize> {
        let now = self.clock.now();
        let mut restored = 0;

        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mapping: MappingLine = serde_json::from_str(&line)?;

            let Some(client) = ClientKey::from_persisted(&mapping.client) else {
                warn!(client = %mapping.client, "skipping mapping with unparseable client");
                continue;
            };
            let expiry = DateTime::parse_from_rfc3339(&mapping.expiry)
                .map_err(|e| StoreError::persist(format!("bad expiry {:?}: {e}", mapping.expiry)))?
                .with_timezone(&Utc);

            let remaining = expiry - now;
            if remaining <= chrono::Duration::seconds(1) {
                debug!(?mapping, "ignore expired mapping");
                continue;
            }
            let Ok(ttl) = remaining.to_std() else {
                continue;
            };

            debug!(?mapping, "recreate mapping");
            self.store_info(
                &client,
                &mapping.lhs.to_lowercase(),
                &mapping.rhs.to_lowercase(),
                ttl,
                mapping.kind == TYPE_NAME,
            );
            restored += 1;
        }

        self.propagate_root_domains();
        Ok(restored)
    }

    /// Write every mapping to `<path>.tmp`, then rename it over `path`.
    pub(crate) fn save_mappings(&self, path: &Path) -> Result<()> {
        debug!(file = %path.display(), "Saving DNS mappings...");
        let tmp = temp_path(path);
        let mut writer = BufWriter::new(File::create(&tmp)?);

        writer.write_all(b"2\n")?;
        let header = FileHeader {
            required_features: Some(SUPPORTED_FEATURES.iter().map(|f| f.to_string()).collect()),
            epoch: self.epoch,
        };
        serde_json::to_writer(&mut writer, &header)?;
        writer.write_all(b"\n")?;

        let mut saved = 0usize;
        for (client, lookup) in &self.clients {
            let client = client.to_string();
            for (name, entry) in &lookup.mappings {
                for (value, value_entry) in &entry.values {
                    let line = MappingLine {
                        client: client.clone(),
                        lhs: name.clone(),
                        rhs: value.clone(),
                        expiry: value_entry
                            .expiry
                            .to_rfc3339_opts(SecondsFormat::Secs, true),
                        kind: if value_entry.is_name { TYPE_NAME } else { TYPE_IP }.to_string(),
                    };
                    serde_json::to_writer(&mut writer, &line)?;
                    writer.write_all(b"\n")?;
                    saved += 1;
                }
            }
        }

        let file = writer
            .into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;

        debug!(file = %path.display(), saved, "Finished saving DNS mappings");
        Ok(())
    }
}
