//! Health status of the render service.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Accepting renders; at least one slot is free
    #[default]
    Ready,
    /// Accepting renders, but every slot is held and new calls will wait
    Busy,
    /// Rejecting renders while workers are stopped
    ShuttingDown,
}
