use rand::{thread_rng, Rng};

/// Generate a fresh holder token: 128 random bits, hex encoded.
pub fn generate() -> String {
    format!("{:032x}", thread_rng().gen::<u128>())
}
