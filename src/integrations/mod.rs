//! Upstream source integrations.

pub mod sources {
    pub use crate::sources::*;
}

pub mod services {
    pub use crate::services::*;
}
