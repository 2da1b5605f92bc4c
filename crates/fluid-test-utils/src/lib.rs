// fluid-test-utils: Shared test utilities for the runtime suite.
//
// Provides a mock IPC listener that records the NUL-framed messages a
// runtime under test emits on its control socket.

pub mod mock_ipc_server;

pub use mock_ipc_server::MockIpcServer;
