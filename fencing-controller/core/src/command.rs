//! Administrative mutations of the fencing declaration.

use crate::{
    store::{self, DeclarationStore, Versioned},
    FencingSet, InstanceId, ParseError, WILDCARD,
};
use std::{fmt, str::FromStr};
use tracing::{debug, info};

/// The number of times a command is retried against conflicting writes before
/// giving up.
pub const MAX_ATTEMPTS: usize = 5;

/// Names either a single instance or, with `*`, every instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    All,
    Instance(InstanceId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    On(Target),
    Off(Target),

    /// Replaces the declaration wholesale, as when the annotation is edited
    /// directly.
    Replace(FencingSet),
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidFencingRequest {
    #[error("cannot fence instance {0} while all instances are fenced")]
    FenceInstanceWhileAllFenced(InstanceId),

    #[error("cannot unfence instance {0} while all instances are fenced; unfence \"*\" instead")]
    UnfenceInstanceWhileAllFenced(InstanceId),

    #[error("an instance name is required")]
    EmptyName,

    #[error(transparent)]
    Malformed(#[from] ParseError),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid fencing request: {0}")]
    Invalid(#[from] InvalidFencingRequest),

    #[error("gave up after {attempts} conflicting updates to the fencing declaration")]
    Conflict { attempts: usize },

    #[error("failed to access the fencing declaration: {0}")]
    Store(#[source] store::Error),
}

// === impl Target ===

impl FromStr for Target {
    type Err = InvalidFencingRequest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(InvalidFencingRequest::EmptyName),
            WILDCARD => Ok(Self::All),
            name => Ok(Self::Instance(name.into())),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str(WILDCARD),
            Self::Instance(id) => id.fmt(f),
        }
    }
}

// === impl Command ===

impl Command {
    /// Computes the declaration that results from applying this command to
    /// `current`.
    pub fn apply(&self, current: &FencingSet) -> Result<FencingSet, InvalidFencingRequest> {
        match (self, current) {
            (Self::Replace(set), _) => Ok(set.clone()),

            (Self::On(Target::All), _) => Ok(FencingSet::All),
            (Self::On(Target::Instance(id)), FencingSet::All) => Err(
                InvalidFencingRequest::FenceInstanceWhileAllFenced(id.clone()),
            ),
            (Self::On(Target::Instance(id)), FencingSet::Explicit(names)) => {
                let mut names = names.clone();
                names.insert(id.clone());
                Ok(FencingSet::Explicit(names))
            }

            (Self::Off(Target::All), _) => Ok(FencingSet::none()),
            (Self::Off(Target::Instance(id)), FencingSet::All) => Err(
                InvalidFencingRequest::UnfenceInstanceWhileAllFenced(id.clone()),
            ),
            (Self::Off(Target::Instance(id)), FencingSet::Explicit(names)) => {
                let mut names = names.clone();
                names.remove(id);
                Ok(FencingSet::Explicit(names))
            }
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On(target) => write!(f, "fencing on {target}"),
            Self::Off(target) => write!(f, "fencing off {target}"),
            Self::Replace(set) => write!(f, "fencing set {set}"),
        }
    }
}

/// Applies `command` to the declaration held by `store`, retrying up to
/// [`MAX_ATTEMPTS`] times when the declaration changes underneath it.
///
/// Returns the resulting declaration.
pub async fn execute<S>(store: &S, command: &Command) -> Result<FencingSet, Error>
where
    S: DeclarationStore + ?Sized,
{
    execute_with_attempts(store, command, MAX_ATTEMPTS).await
}

pub async fn execute_with_attempts<S>(
    store: &S,
    command: &Command,
    attempts: usize,
) -> Result<FencingSet, Error>
where
    S: DeclarationStore + ?Sized,
{
    for attempt in 1..=attempts {
        let (current, version) = match store.get().await {
            Ok(Versioned { value, version }) => (Some(value), version),
            // A malformed declaration can only be replaced.
            Err(store::Error::Malformed { version, .. }) if matches!(command, Command::Replace(_)) => {
                (None, version)
            }
            Err(error) => return Err(Error::Store(error)),
        };

        let next = match current {
            Some(current) => {
                let next = command.apply(&current)?;
                if next == current {
                    debug!(%command, fencing = %next, "Declaration already up to date");
                    return Ok(next);
                }
                next
            }
            None => command.apply(&FencingSet::none())?,
        };

        match store.set(&next, &version).await {
            Ok(()) => {
                info!(%command, fencing = %next, "Updated fencing declaration");
                return Ok(next);
            }
            Err(store::Error::Conflict) => {
                debug!(%command, attempt, "Fencing declaration changed concurrently; retrying");
            }
            Err(error) => return Err(Error::Store(error)),
        }
    }

    Err(Error::Conflict { attempts })
}
