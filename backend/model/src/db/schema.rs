diesel::table! {
	branch (id) {
		id -> BigInt,
		/// Name of the branch.
		///
		/// This should be equal to the Git branch name, and should not
		/// be changed after branch insertion.
		name -> VarChar,
		/// ID of the base branch.
		base -> Nullable<BigInt>,
		/// See [crate::branch::SqlBranchStatus].
		status -> Int2,
		status_msg -> Nullable<VarChar>,
		/// Priority of this branch.
		///
		/// By default, the base priority should be 100.
		priority -> Int2,
		/// See [crate::branch::SqlTrackingMode].
		tracking -> Int2,
		/// Last synchronized commit.
		commit_oid -> Nullable<Binary>,
		/// Count of tracked packages in this branch.
		total_srcpkgs -> Int4,
	}
}

diesel::table! {
	use crate::db::utils::*;
	use diesel::sql_types::*;

	job_queue (id) {
		/// Unique identifier of this job.
		///
		/// The ID must be a UUID v7, of which timestamp is the time when
		/// the job is enqueued.
		id -> XUuid,
		kind -> VarChar,
		data -> XJson,
		priority -> Int2,
		/// Count of failed attempts.
		attempts -> Int2,
		/// Started time of this job.
		///
		/// This column is null when and only when the job is not claimed.
		started_at -> Nullable<Timestamp>,
	}
}

diesel::table! {
	use crate::db::utils::*;
	use diesel::sql_types::*;

	/// Table for tracked packages.
	pkg (id) {
		id -> XUuid,
		branch -> BigInt,
		name -> VarChar,
		section -> VarChar,
		/// See [crate::package::SqlPackageStatus].
		status -> Int2,
		status_msg -> Nullable<VarChar>,
		data -> XJson,
	}
}

diesel::table! {
	use crate::db::utils::*;
	use diesel::sql_types::*;

	/// Table for (tracked packages, target).
	///
	/// Unsupported pairs (i.e. target is excluded by the package definition)
	/// should not be in this table.
	pkg_target (id) {
		id -> XUuid,
		branch -> BigInt,
		package -> XUuid,
		target -> XUuid,
		/// See [crate::package::SqlPackageTargetStatus].
		status -> Int2,
		status_msg -> Nullable<VarChar>,
		data -> XJson,
	}
}

diesel::allow_tables_to_appear_in_same_query!(branch, job_queue, pkg, pkg_target);
