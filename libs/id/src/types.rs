//! Identifier kinds used across the engine.

use crate::define_id;

define_id!(RunId, "run");
define_id!(WaitpointId, "waitpoint");
define_id!(EnvId, "env");
define_id!(LeaseId, "lease");
define_id!(RequestId, "req");
