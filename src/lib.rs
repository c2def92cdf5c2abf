pub mod crypto;
pub mod cube;
pub mod field;
pub mod net;
pub mod store;
pub mod types;

pub use crypto::{fingerprint, sha3, trailing_zero_bits, Keypair};
pub use cube::{Cube, CubeError, CubeMeta};
pub use field::{Field, FieldDef, FieldEquality, FieldError, FieldType, Fields};
pub use net::{NetConfig, NetEvent, NetworkManager, PeerDb, Server};
pub use store::{cube_contest, CubeStore, RetentionPolicy, StoreError};
pub use types::*;
