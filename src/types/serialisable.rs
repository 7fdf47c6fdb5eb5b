/// Types implementing `WireSerialisable` can be written back to a client of
/// the control protocol.
pub trait WireSerialisable {
    /// Converts the value in question to its on-the-wire response bytes.
    fn serialise_wire(&self) -> Vec<u8>;
}
