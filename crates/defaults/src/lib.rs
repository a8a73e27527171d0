//! Stamp defaults: fills unset fields from the config snapshot and records
//! who created and last changed an object.
//!
//! ```ignore
//! let ctx = store.to_context(RequestContext::new().within_create().with_user_info(user("alice")));
//! obj.set_defaults(&ctx);
//! ```

#![forbid(unsafe_code)]

pub mod audit;
pub mod engine;

pub use audit::{semantically_equal, AuditAction, AuditState};
pub use engine::SetDefaults;
