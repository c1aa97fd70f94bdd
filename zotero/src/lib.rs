pub mod local;
pub mod metadata;
pub mod port;
pub mod remote;
pub mod router;
pub mod types;

pub use port::{LocalResolutionProbe, ResolvedSource, ZoteroError, ZoteroSource};
pub use router::{Strategy, ZoteroSourceRouter};
