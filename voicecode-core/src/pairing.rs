//! Pairing-instructions hook (§10.6). The bundled behavior prints the key
//! to stdout; a real QR-code renderer is an external collaborator this
//! crate only defines the seam for.

pub trait PairingSink: Send + Sync {
    fn print_pairing_instructions(&self, bind_address: &str, key: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutPairingSink;

impl PairingSink for StdoutPairingSink {
    fn print_pairing_instructions(&self, bind_address: &str, key: &str) {
        println!("voicecode listening on {bind_address}");
        println!("pairing key: {key}");
    }
}
