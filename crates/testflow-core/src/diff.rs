//! Changed-file diff types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of change a file underwent between the base and target commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// Map from repo-relative path to its change kind.
///
/// An *empty* map is meaningful on its own: a PR whose net changes cancel
/// out produces an empty diff that still counts as "diff known". Whether a
/// diff could be computed at all is tracked separately (`diff_exists`) by
/// the callers, so absence and emptiness never collapse into one state.
pub type Diff = HashMap<String, ChangeKind>;
