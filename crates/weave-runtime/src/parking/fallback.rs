//! Condvar parker for platforms without futex

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use super::ContextParking;

pub struct CondvarParker {
    permit: Mutex<bool>,
    condvar: Condvar,
}

impl CondvarParker {
    pub fn new() -> Self {
        CondvarParker { permit: Mutex::new(false), condvar: Condvar::new() }
    }
}

impl Default for CondvarParker {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextParking for CondvarParker {
    fn park(&self, timeout: Option<Duration>) -> bool {
        let mut permit = self.permit.lock().unwrap_or_else(PoisonError::into_inner);
        if !*permit {
            permit = match timeout {
                Some(t) => {
                    self.condvar
                        .wait_timeout(permit, t)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.condvar.wait(permit).unwrap_or_else(PoisonError::into_inner),
            };
        }
        std::mem::replace(&mut *permit, false)
    }

    fn unpark(&self) {
        let mut permit = self.permit.lock().unwrap_or_else(PoisonError::into_inner);
        if !*permit {
            *permit = true;
            self.condvar.notify_one();
        }
    }
}
