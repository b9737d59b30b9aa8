//! Identifier and alias generation.

use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;

/// Prefix shared by all room ids. The relay's disconnect cascade and the
/// session's ownership checks rely on it.
pub const ROOM_ID_PREFIX: &str = "room_";

/// Random suffix length of a generated room id.
pub const ROOM_ID_SUFFIX_LEN: usize = 5;

const ADJECTIVES: &[&str] = &[
    "Happy", "Lucky", "Swift", "Quiet", "Brave", "Smart", "Gentle", "Cool", "Bright",
];

const FRUITS: &[&str] = &[
    "Apple",
    "Banana",
    "Orange",
    "Mango",
    "Pineapple",
    "Strawberry",
    "Grape",
    "Watermelon",
    "Peach",
    "Pear",
    "Cherry",
    "Avocado",
    "Coconut",
    "Papaya",
    "Dragon Fruit",
    "Lychee",
    "Longan",
    "Durian",
];

/// Generates a room id: the `room_` prefix plus a short alphanumeric suffix.
///
/// Ids are unique by convention, not construction; the relay surfaces a
/// collision as an explicit error to the creator.
pub fn room_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ROOM_ID_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{ROOM_ID_PREFIX}{suffix}")
}

/// Generates an upload task id: `upload_` plus a short alphanumeric
/// suffix. Doubles as the sub-channel label of the task's transfer.
pub fn upload_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ROOM_ID_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("upload_{suffix}")
}

/// Picks a display alias of the form "Adjective Fruit".
pub fn random_alias() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES
        .choose(&mut rng)
        .copied()
        .unwrap_or("Quiet");
    let fruit = FRUITS.choose(&mut rng).copied().unwrap_or("Apple");
    format!("{adjective} {fruit}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_shape() {
        let id = room_id();
        assert!(id.starts_with(ROOM_ID_PREFIX));
        assert_eq!(id.len(), ROOM_ID_PREFIX.len() + ROOM_ID_SUFFIX_LEN);
        assert!(
            id[ROOM_ID_PREFIX.len()..]
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        );
    }

    #[test]
    fn upload_id_shape() {
        let id = upload_id();
        assert!(id.starts_with("upload_"));
        assert!(
            id["upload_".len()..]
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        );
    }

    #[test]
    fn room_ids_vary() {
        let a = room_id();
        let b = room_id();
        let c = room_id();
        assert!(a != b || b != c);
    }

    #[test]
    fn alias_is_two_words() {
        let alias = random_alias();
        let mut parts = alias.splitn(2, ' ');
        let adjective = parts.next().unwrap();
        let fruit = parts.next().unwrap();
        assert!(ADJECTIVES.contains(&adjective));
        assert!(FRUITS.contains(&fruit));
    }
}
