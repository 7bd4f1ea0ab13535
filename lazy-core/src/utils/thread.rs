use std::thread;

/// Hands `data` to a short-lived thread so that freeing a large allocation does
/// not stall the caller.
pub fn drop_in_background_thread<T>(data: T)
where
    T: Send + 'static,
{
    thread::spawn(move || drop(data));
}

/// Number of worker threads to use when the caller does not say.
pub fn default_parallelism() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or_else(|_| rayon::current_num_threads())
}
