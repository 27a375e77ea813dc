//! Integration tests, one module per component

mod test_engine;
mod test_fsm;
mod test_inventory;
mod test_lifecycle;
mod test_resolver;
