use tokio::sync::watch;

/// Last-known value of a peripheral attribute.
///
/// Single writer, many readers. Starts out unknown (`None`).
#[derive(Debug)]
pub struct ObservableValue<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T> ObservableValue<T>
where
    T: Clone + PartialEq + Send + Sync,
{
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Store a new value. Observers are only woken when it actually changes.
    pub fn set(&self, value: T) {
        self.tx.send_if_modified(|current| {
            if current.as_ref() == Some(&value) {
                false
            } else {
                *current = Some(value);
                true
            }
        });
    }

    /// Forget the value, back to unknown.
    pub fn clear(&self) {
        self.tx.send_if_modified(|current| current.take().is_some());
    }

    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<T>> {
        self.tx.subscribe()
    }
}

impl<T> Default for ObservableValue<T>
where
    T: Clone + PartialEq + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}
