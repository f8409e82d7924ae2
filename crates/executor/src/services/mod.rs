pub mod dispatch_service;
pub mod ingest_service;
pub mod reconcile_service;
pub mod telegram_service;

#[cfg(test)]
pub(crate) mod testing;
