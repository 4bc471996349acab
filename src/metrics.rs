//! Relay counters. Without an installed recorder these are no-ops.

use metrics::{decrement_gauge, increment_counter, increment_gauge};

pub fn connection_opened() {
    increment_gauge!("meshcall_connections", 1.0);
}

pub fn connection_closed() {
    decrement_gauge!("meshcall_connections", 1.0);
}

pub fn participant_joined() {
    increment_counter!("meshcall_joins_total");
}

pub fn participant_left() {
    increment_counter!("meshcall_leaves_total");
}

pub fn signal_forwarded() {
    increment_counter!("meshcall_signals_forwarded_total");
}

pub fn signal_dropped() {
    increment_counter!("meshcall_signals_dropped_total");
}

pub fn broadcast_sent(recipients: usize) {
    increment_counter!("meshcall_broadcasts_total");
    if recipients == 0 {
        increment_counter!("meshcall_broadcasts_unheard_total");
    }
}
