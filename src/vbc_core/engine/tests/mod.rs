mod common;
mod control_events;
