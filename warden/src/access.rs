use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::{registry::Role, Error, Result};

/// Operation classes gated by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Read,
    Write,
    Elect,
    AdminPairing,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Read,
        Operation::Write,
        Operation::Elect,
        Operation::AdminPairing,
    ];

    pub fn is_write_class(self) -> bool {
        matches!(self, Operation::Write)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Elect => "elect",
            Operation::AdminPairing => "admin-pairing",
        };
        f.write_str(name)
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(Operation::Read),
            "write" => Ok(Operation::Write),
            "elect" => Ok(Operation::Elect),
            "admin-pairing" => Ok(Operation::AdminPairing),
            other => Err(Error::Config(format!("Unknown operation {other:?}"))),
        }
    }
}

/// The fixed role matrix. Anything not listed is denied.
///
/// | role      | read | write | elect | admin-pairing |
/// |-----------|------|-------|-------|---------------|
/// | WORKER    | no   | no    | no    | no            |
/// | AUTHORITY | yes  | no    | yes   | yes           |
/// | STORAGE   | yes  | yes   | no    | no            |
pub const fn permitted(role: Role, operation: Operation) -> bool {
    matches!(
        (role, operation),
        (Role::Authority, Operation::Read | Operation::Elect | Operation::AdminPairing)
            | (Role::Storage, Operation::Read | Operation::Write)
    )
}

/// Applies the role matrix, optionally letting AUTHORITY persist on clusters without STORAGE nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleEnforcer {
    authority_persists: bool,
}

impl RoleEnforcer {
    /// The matrix exactly as written: AUTHORITY delegates durable writes to STORAGE.
    pub const fn strict() -> Self {
        Self {
            authority_persists: false,
        }
    }

    /// Single-role deployment where the elected AUTHORITY also persists.
    pub const fn authority_persists() -> Self {
        Self {
            authority_persists: true,
        }
    }

    pub const fn new(authority_persists: bool) -> Self {
        Self { authority_persists }
    }

    pub fn permits(&self, role: Role, operation: Operation) -> bool {
        match (role, operation) {
            // No override path for workers.
            (Role::Worker, _) => false,
            (Role::Authority, Operation::Write) => self.authority_persists,
            _ => permitted(role, operation),
        }
    }

    /// Same as [`permits`](Self::permits) for an operation named by a collaborator.
    /// Unknown names are denied.
    pub fn permits_named(&self, role: Role, operation: &str) -> bool {
        operation
            .parse::<Operation>()
            .is_ok_and(|op| self.permits(role, op))
    }

    pub fn authorize(&self, role: Role, operation: Operation) -> Result<()> {
        if self.permits(role, operation) {
            Ok(())
        } else {
            Err(Error::RoleDenied { role, operation })
        }
    }
}

impl Default for RoleEnforcer {
    fn default() -> Self {
        Self::strict()
    }
}
