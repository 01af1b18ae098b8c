use std::{future::Future, sync::LazyLock};

use tokio::runtime::{Builder, Runtime};

static GLOBAL_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
    Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to start the blocking facade runtime")
});

/// Run a future in the foreground, blocking on it completing.
pub(crate) fn block_on<F, T>(fut: F) -> T
where
    F: Future<Output = T>,
{
    GLOBAL_RUNTIME.block_on(fut)
}
