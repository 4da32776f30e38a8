//! Secure code loader: the device-side end of code distribution.
//!
//! Processing order for each sealed unit is fixed:
//!
//!   1. decrypt with the pre-shared key (trailing bytes are the IV)
//!   2. hash the decrypted bytes and compare against the 32-byte header
//!   3. define the unit in a fresh [`LoaderScope`]
//!   4. if it has the action capability, instantiate and invoke it;
//!      otherwise keep it as a passive load
//!
//! Nothing is parsed before step 2 passes. Failures at any stage discard
//! the unit, are logged, and leave the device running; a panicking unit is
//! caught like any other failure.

pub mod context;
pub mod unit;

use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::Mutex;

use ensemble_core::crypto::{CodeKey, CryptoError, SealedParts, HASH_LEN};

pub use context::{new_store, ExecutionContext, LoggingOutput, OutputSink, SharedStore};
pub use unit::{
    ActionRegistry, LoadedUnit, LoaderScope, NativeAction, Step, UnitInstance, UnitManifest,
    ACTION_CAPABILITY,
};

#[derive(Debug, thiserror::Error)]
pub enum CodeError {
    #[error("sealed unit too short ({0} bytes)")]
    TooShort(usize),

    #[error("decryption failed (controller and device keys probably differ)")]
    Decryption,

    #[error("integrity check failed: header {expected} != content {actual}")]
    Integrity { expected: String, actual: String },

    #[error("malformed unit: {0}")]
    Malformed(String),

    #[error("unit {0} already defined in this scope")]
    DuplicateName(String),

    #[error("failed to instantiate {unit}: {reason}")]
    Instantiation { unit: String, reason: String },

    #[error("{unit} failed: {reason}")]
    Invocation { unit: String, reason: String },

    #[error("unit of {0} bytes exceeds the configured maximum")]
    TooLarge(usize),

    #[error("connection idle for {0} ms before EOF")]
    ReadTimeout(u64),

    #[error("connection from {0} rejected by access mode")]
    AccessDenied(std::net::IpAddr),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for CodeError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::TooShort(n) => CodeError::TooShort(n),
            CryptoError::Encryption | CryptoError::Decryption => CodeError::Decryption,
            CryptoError::Integrity { expected, actual } => CodeError::Integrity {
                expected: hex::encode(&expected[..8]),
                actual: hex::encode(&actual[..8]),
            },
        }
    }
}

/// What happened to a unit that passed decryption and integrity checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Action unit instantiated and run to completion.
    Executed { name: String },
    /// Defined but not invoked.
    Passive { name: String },
}

pub struct SecureCodeLoader {
    key: CodeKey,
    registry: ActionRegistry,
    ctx: ExecutionContext,
    /// Scope of the most recent load, kept for inspection.
    last_scope: Mutex<Option<LoaderScope>>,
}

impl SecureCodeLoader {
    pub fn new(key: CodeKey, registry: ActionRegistry, ctx: ExecutionContext) -> Self {
        Self {
            key,
            registry,
            ctx,
            last_scope: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Id of the scope the last unit was defined in.
    pub fn last_scope_id(&self) -> Option<u64> {
        self.last_scope.lock().as_ref().map(LoaderScope::id)
    }

    /// Decrypt, verify, define and (for action units) run one sealed unit.
    pub fn process(&self, sealed: &[u8]) -> Result<LoadOutcome, CodeError> {
        let parts = SealedParts::split(sealed)?;

        let plaintext = parts.decrypt(&self.key).map_err(|e| {
            tracing::warn!(
                bytes = sealed.len(),
                "code unit decryption failed, check that controller and device share the same key"
            );
            CodeError::from(e)
        })?;

        if let Err(e) = parts.verify(&plaintext) {
            tracing::warn!(
                header = hex::encode(&parts.header[..8]),
                "code unit failed integrity check, discarding"
            );
            return Err(e.into());
        }

        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&parts.header);

        let manifest = UnitManifest::parse(&plaintext)?;
        let mut scope = LoaderScope::new();
        let unit = scope.define(manifest, hash)?;
        tracing::info!(
            unit = unit.name(),
            scope = scope.id(),
            hash = hex::encode(&hash[..8]),
            "code unit loaded"
        );
        *self.last_scope.lock() = Some(scope);

        if !unit.is_action() {
            tracing::info!(unit = unit.name(), "unit has no action capability, loaded passively");
            return Ok(LoadOutcome::Passive {
                name: unit.name().to_string(),
            });
        }

        let instance = unit.instantiate(&self.registry)?;
        self.invoke(&instance)?;

        self.ctx.set_status(&format!("Last action: {}", instance.name()));
        Ok(LoadOutcome::Executed {
            name: instance.name().to_string(),
        })
    }

    fn invoke(&self, instance: &UnitInstance) -> Result<(), CodeError> {
        let invocation_error = |reason: String| CodeError::Invocation {
            unit: instance.name().to_string(),
            reason,
        };
        match catch_unwind(AssertUnwindSafe(|| instance.run(&self.ctx))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(invocation_error(format!("{e:#}"))),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                Err(invocation_error(format!("panicked: {reason}")))
            }
        }
    }
}
