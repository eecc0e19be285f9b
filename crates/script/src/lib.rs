//! Script verification and sighash.
//!
//! Block validation consumes this through a narrow interface: the standard
//! spend templates (P2PK, P2PKH, P2SH-wrapped, P2WPKH) and signature-hash
//! computation. Exotic script programs verify vacuously true under the
//! anyone-can-spend rule the interpreter applies to unknown templates.

pub mod sighash;
pub mod standard;
pub mod verify;

mod secp;

pub use standard::{classify_script_pubkey, sigop_count, ScriptType};
pub use verify::{verify_input, ScriptError, ScriptFlags, SCRIPT_VERIFY_P2SH, SCRIPT_VERIFY_WITNESS};
