use std::collections::BTreeSet;

/// Rooms this client should be in. Survives reconnects so every room can be
/// re-joined on a fresh connection.
#[derive(Debug, Clone, Default)]
pub struct RoomRegistry {
    rooms: BTreeSet<String>,
}

impl RoomRegistry {
    /// Returns `true` only if the room was not already joined.
    pub fn join(&mut self, room: &str) -> bool {
        if self.rooms.contains(room) {
            return false;
        }
        self.rooms.insert(room.to_string())
    }

    /// Returns `true` only if the room was joined.
    pub fn leave(&mut self, room: &str) -> bool {
        self.rooms.remove(room)
    }

    pub fn contains(&self, room: &str) -> bool {
        self.rooms.contains(room)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.rooms.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_leave_are_idempotent() {
        let mut rooms = RoomRegistry::default();
        assert!(rooms.join("a1"));
        assert!(!rooms.join("a1"));
        assert_eq!(rooms.len(), 1);

        assert!(rooms.leave("a1"));
        assert!(!rooms.leave("a1"));
        assert!(!rooms.leave("never-joined"));
        assert!(rooms.is_empty());
    }

    #[test]
    fn test_to_vec_is_sorted() {
        let mut rooms = RoomRegistry::default();
        rooms.join("s2");
        rooms.join("s1");
        assert_eq!(rooms.to_vec(), vec!["s1".to_string(), "s2".to_string()]);
    }
}
