// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use tracing::{debug, info, warn};

use relay_events::{Event, EventBus};

use crate::profile::CapabilityProfile;

/// An immutable set of profiles keyed by model id.  Readers hold an `Arc`
/// snapshot; reload builds a fresh set and swaps the pointer.
pub type ProfileSet = HashMap<String, Arc<CapabilityProfile>>;

/// Narrow read-only view of the registry.
///
/// The router, the provider adapter, and the tool-server supervisor depend
/// on this trait rather than on [`ProfileStore`], which keeps the registry
/// free of reverse dependencies.
pub trait ProfileView: Send + Sync {
    /// The profile for `model_id`; unknown models get a synthesised
    /// minimal default rather than an error.
    fn profile(&self, model_id: &str) -> Arc<CapabilityProfile>;

    /// Canonical tool name for a possibly-aliased `name` as emitted by
    /// `model_id`.  Idempotent; unknown names pass through.
    fn resolve_alias(&self, model_id: &str, name: &str) -> String {
        self.profile(model_id).resolve_alias(name).to_string()
    }
}

/// Read-mostly profile store backed by a YAML file.
///
/// The file maps model id → profile:
///
/// ```yaml
/// qwen2.5-coder:
///   wire_format: hermes_xml
///   tools: [read_file, search]
///   aliases:
///     fs.read: read_file
/// ```
pub struct ProfileStore {
    path: PathBuf,
    current: RwLock<Arc<ProfileSet>>,
}

impl ProfileStore {
    /// Load the store from `path`.  A missing or unreadable file logs a
    /// warning and yields an empty set; profile problems must never stop
    /// the proxy from starting.
    pub fn open(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        let set = match read_profiles(&path) {
            Ok(set) => {
                info!(path = %path.display(), models = set.len(), "capability profiles loaded");
                set
            }
            Err(e) => {
                warn!(path = %path.display(), "capability profile store unavailable: {e:#}");
                ProfileSet::new()
            }
        };
        Arc::new(Self {
            path,
            current: RwLock::new(Arc::new(set)),
        })
    }

    /// Atomically replace the active snapshot with a fresh read of the
    /// backing file.  In-flight readers keep the snapshot they already
    /// hold.
    pub fn reload(&self) -> anyhow::Result<()> {
        let set = read_profiles(&self.path)?;
        debug!(models = set.len(), "capability profiles reloaded");
        *self.current.write().expect("profile store poisoned") = Arc::new(set);
        Ok(())
    }

    /// A consistent snapshot pointer for bulk inspection.
    pub fn snapshot(&self) -> Arc<ProfileSet> {
        Arc::clone(&self.current.read().expect("profile store poisoned"))
    }

    /// Spawn the invalidation watcher: reload whenever a
    /// `ProfilesInvalidated` event appears on the bus.
    pub fn watch_invalidation(self: Arc<Self>, bus: &Arc<EventBus>) {
        let store = self;
        let mut sub = bus.subscribe(32);
        tokio::spawn(async move {
            while let Some(env) = sub.recv().await {
                if matches!(env.event, Event::ProfilesInvalidated) {
                    if let Err(e) = store.reload() {
                        warn!("profile reload failed: {e:#}");
                    }
                }
            }
        });
    }
}

impl ProfileView for ProfileStore {
    fn profile(&self, model_id: &str) -> Arc<CapabilityProfile> {
        let snapshot = self.snapshot();
        match snapshot.get(model_id) {
            Some(p) => Arc::clone(p),
            None => Arc::new(CapabilityProfile::synthetic(model_id)),
        }
    }
}

fn read_profiles(path: &std::path::Path) -> anyhow::Result<ProfileSet> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let raw: HashMap<String, CapabilityProfile> =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(raw.into_iter().map(|(k, v)| (k, Arc::new(v))).collect())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
