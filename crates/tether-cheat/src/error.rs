use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheatError {
    #[error("no process attached")]
    NotAttached,
    #[error("unknown cheat id")]
    UnknownId,
    #[error("master cheat cannot be disabled")]
    CannotDisableMasterCheat,
    #[error("cheat definition rejected")]
    InvalidCheat,
    #[error("cheat slots exhausted")]
    OutOfCheats,
    #[error("frozen address limit reached")]
    TooManyFrozenAddresses,
    #[error("address already frozen")]
    AddressAlreadyFrozen,
    #[error("address not frozen")]
    AddressNotFrozen,
    #[error("width must be 1, 2, 4 or 8")]
    InvalidWidth,
    #[error("debug process memory access failed")]
    ProcessAccess,
    #[error("attach failed")]
    AttachFailed,
}
