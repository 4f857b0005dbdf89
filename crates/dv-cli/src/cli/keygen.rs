//! Keygen Command Implementation

use dv_core::crypto::TunnelKeyPair;

/// Print a fresh tunnel key pair in `wg` base64 form
pub fn run() {
    let pair = TunnelKeyPair::generate();
    println!("PrivateKey = {}", pair.secret_base64());
    println!("PublicKey = {}", pair.public_key().to_base64());
}
