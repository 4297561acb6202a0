//! Ordered permission levels.

/// Permission level attached to a connection.
///
/// Totally ordered: a handler requiring level `L` admits any connection with
/// `level >= L`. New connections start at [`PermissionLevel::None`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum PermissionLevel {
    /// Unauthenticated.
    #[default]
    None = 0,
    /// Identified but unprivileged.
    Guest = 1,
    /// Authenticated user.
    User = 2,
    /// Elevated operations.
    Privileged = 3,
    /// Full control.
    Admin = 4,
}

impl PermissionLevel {
    /// Storage value.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse a storage value. `None` if out of range.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Guest),
            2 => Some(Self::User),
            3 => Some(Self::Privileged),
            4 => Some(Self::Admin),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_total() {
        assert!(PermissionLevel::None < PermissionLevel::Guest);
        assert!(PermissionLevel::Guest < PermissionLevel::User);
        assert!(PermissionLevel::User < PermissionLevel::Privileged);
        assert!(PermissionLevel::Privileged < PermissionLevel::Admin);
    }

    #[test]
    fn storage_round_trip() {
        for level in [
            PermissionLevel::None,
            PermissionLevel::Guest,
            PermissionLevel::User,
            PermissionLevel::Privileged,
            PermissionLevel::Admin,
        ] {
            assert_eq!(PermissionLevel::from_u8(level.to_u8()), Some(level));
        }
        assert_eq!(PermissionLevel::from_u8(5), None);
    }
}
