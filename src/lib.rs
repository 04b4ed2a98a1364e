#[cfg(target_os = "wasi")]
pub mod evloop;
#[cfg(not(target_os = "wasi"))]
compile_error!("eventide's event loop requires the wasi target");

pub mod stdx;

#[cfg(test)]
pub(crate) mod test_utils;
