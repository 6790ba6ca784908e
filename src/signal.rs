// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Ctrl-C routing.
//!
//! The OS allows a single interrupt handler per process, so MIDIO installs
//! one dispatcher (lazily, the first time an action is registered) and
//! routes through a swappable action slot. `receive_message` registers an
//! action for the duration of its wait and restores the slot afterwards;
//! with the slot empty, a Ctrl-C terminates the process the way the
//! default disposition would.
//!
//! On UNIX the `ctrlc` crate runs the dedicated signal-receiving thread
//! this requires (signal handlers cannot touch mutexes or condition
//! variables); on Windows it registers a console control handler.

use std::sync::Once;

use parking_lot::Mutex;
use tracing::warn;

static SIGINT_ACTION: Mutex<Option<Box<dyn FnMut() + Send>>> = Mutex::new(None);
static INSTALL: Once = Once::new();

/// Install `action` as the Ctrl-C behavior until the next
/// [`clear_sigint_action`].
pub fn set_sigint_action<F>(action: F)
where
    F: FnMut() + Send + 'static,
{
    INSTALL.call_once(|| {
        let result = ctrlc::set_handler(|| {
            let mut slot = SIGINT_ACTION.lock();
            match slot.as_mut() {
                Some(action) => action(),
                // emulate the default SIGINT disposition
                None => std::process::exit(130),
            }
        });
        if let Err(err) = result {
            warn!("could not install the Ctrl-C handler: {}", err);
        }
    });
    *SIGINT_ACTION.lock() = Some(Box::new(action));
}

/// Restore the default Ctrl-C behavior.
pub fn clear_sigint_action() {
    *SIGINT_ACTION.lock() = None;
}
