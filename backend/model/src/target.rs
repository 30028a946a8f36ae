use kstring::KString;
use uuid::Uuid;

/// Target identifier, derived from the target name.
///
/// This is calculated by [TargetInfo::make_id].
pub type TargetId = Uuid;

/// Namespace of name-based target identifiers.
const TARGET_NAMESPACE: Uuid = Uuid::from_u128(0x1f0c_58d2_7a4e_4c1b_9d7e_2b8a_64f0_3c15);

/// Information related to a build target.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TargetInfo {
	pub id: TargetId,
	/// Name of the target.
	pub name: KString,
	/// Architecture name passed to builders.
	pub arch: KString,
}

impl TargetInfo {
	/// Derives the stable identifier of a target name.
	///
	/// Identifiers are persisted, so they must not depend on
	/// the process or the toolchain version.
	pub fn make_id<S: AsRef<str>>(name: S) -> TargetId {
		Uuid::new_v5(&TARGET_NAMESPACE, name.as_ref().as_bytes())
	}
}

impl PartialOrd for TargetInfo {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for TargetInfo {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.name.cmp(&other.name)
	}
}
