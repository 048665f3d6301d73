/// Length of generated record identifiers.
pub const ID_LENGTH: usize = 6;

/// The 62-symbol alphanumeric alphabet ids are drawn from.
pub const ALPHABET: [char; 62] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O',
    'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b', 'c', 'd',
    'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7',
    '8', '9',
];

/// Generate an opaque record identifier.
///
/// Collisions are not checked here; the collection engine rejects an insert
/// whose generated id already exists and retries.
pub fn generate_id() -> String {
    nanoid::nanoid!(ID_LENGTH, &ALPHABET)
}
