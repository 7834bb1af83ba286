// Integration tests follow the organization suggested by Matklad:
// https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html

mod kernel_cross_context;
mod kernel_scheduling;
mod kernel_teardown;
mod peer_setup;
mod peer_sync;
