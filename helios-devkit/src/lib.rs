/*!
# Helios DevKit - Stubs et Utilitaires pour Tests d'Agent

Bibliothèque facilitant les tests de l'agent Helios avec:
- Backend de coordination simulé (KV, sessions, checks) sans cluster
- Hôte simulé à la place des commandes OS
- Harness multi-nœuds avec intervalles raccourcis
*/

pub mod backend_stub;
pub mod platform_stub;
pub mod test_utils;

pub use backend_stub::{BackendEvent, NodeHandle, SimulatedBackend};
pub use platform_stub::{ArchiveFixture, HostEvent, SimulatedHost};
pub use test_utils::{TestHarness, TestNode};
