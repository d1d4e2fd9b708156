//! Kubernetes mutating admission webhook: validates and mutates pod specs
//! that request storage injection via the `platform.apolo.us/inject-storage`
//! annotation, per spec.md §4.F/§4.G.

pub mod engine;
pub mod schema;
pub mod volume_resolver;
pub mod webhook;

pub use engine::admit;
pub use volume_resolver::{KubeVolume, KubeVolumeResolver, VolumeResolverError};
