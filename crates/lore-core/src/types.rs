/// Logical version counter attached to every record.
pub type Clock = u64;
/// Tie-break rank among updates carrying the same clock.
pub type Quality = u32;

/// Names starting with this prefix are local and never disseminated.
pub const LOCAL_PREFIX: char = '.';

/// Returns whether `name` is a local (non-disseminated) variable name.
pub fn is_local_name(name: &str) -> bool {
    name.starts_with(LOCAL_PREFIX)
}
