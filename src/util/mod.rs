//! Low-level collaborators with no protocol awareness of their own: DER/ASN.1
//! encoding and the crypto primitives the rest of the crate builds on.

pub mod asn1;
pub mod cryptoutil;
