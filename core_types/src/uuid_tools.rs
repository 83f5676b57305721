use uuid::Uuid;

/// Returns a fresh random UUID for identities minted by the kernel itself.
pub fn new_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Builds a UUID from the four-field layout used by application manifests.
pub fn uuid_from_fields(
    time_low: u32,
    time_mid: u16,
    time_hi_and_version: u16,
    clock_seq_and_node: [u8; 8],
) -> Uuid {
    Uuid::from_fields(time_low, time_mid, time_hi_and_version, &clock_seq_and_node)
}
