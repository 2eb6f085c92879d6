pub(crate) use notify_relay_domain::ledger::StorageError;
