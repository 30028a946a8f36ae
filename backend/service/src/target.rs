use std::{collections::HashMap, sync::Arc};

use kiln_backend_model::target::{TargetId, TargetInfo};
use kstring::KString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Result;

/// Registry of the configured build targets.
///
/// Targets are not stored in the database. Rows refer to them by
/// [TargetId], which is derived from the name.
#[derive(Debug)]
pub struct TargetService {
	by_id: HashMap<TargetId, Arc<TargetInfo>>,
	by_name: HashMap<KString, Arc<TargetInfo>>,
}

#[derive(Debug, PartialEq, Eq, Clone, Hash, Serialize, Deserialize)]
pub struct TargetConfig {
	pub name: KString,
	/// Architecture passed to builders, defaults to the name.
	pub arch: Option<KString>,
}

impl TargetService {
	pub fn new(config: &[TargetConfig]) -> Result<Self> {
		let mut service = Self {
			by_id: HashMap::new(),
			by_name: HashMap::new(),
		};

		for target in config {
			if service.by_name.contains_key(&target.name) {
				return Err(TargetError::DuplicateName(target.name.clone()).into());
			}
			let id = TargetInfo::make_id(&target.name);
			let arch = target.arch.clone().unwrap_or_else(|| target.name.clone());

			let target = Arc::new(TargetInfo {
				id,
				name: target.name.clone(),
				arch,
			});
			service.by_id.insert(id, target.clone());
			service.by_name.insert(target.name.clone(), target);
		}

		Ok(service)
	}

	pub fn get(&self, id: &TargetId) -> Option<Arc<TargetInfo>> {
		self.by_id.get(id).cloned()
	}

	pub fn get_or_err(&self, id: &TargetId) -> Result<Arc<TargetInfo>> {
		Ok(self.get(id).ok_or(TargetError::UnknownTarget(*id))?)
	}

	pub fn get_by_name(&self, name: &str) -> Option<Arc<TargetInfo>> {
		self.by_name.get(name).cloned()
	}

	/// All targets, ordered by name.
	pub fn all(&self) -> Vec<Arc<TargetInfo>> {
		let mut targets = self.by_id.values().cloned().collect::<Vec<_>>();
		targets.sort();
		targets
	}
}

#[derive(Debug, Error)]
pub enum TargetError {
	#[error("target {0} is configured twice")]
	DuplicateName(KString),
	#[error("target {0} is not configured")]
	UnknownTarget(TargetId),
}
