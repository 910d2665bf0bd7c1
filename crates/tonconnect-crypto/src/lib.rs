pub mod error;
pub mod keystore;
pub mod session_box;

pub use error::CryptoError;
pub use keystore::StoreKey;
pub use session_box::{KEY_BYTES, KeyPair, NONCE_BYTES, SecretKeyBytes, decrypt, encrypt, generate_keypair};
