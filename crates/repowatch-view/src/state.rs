//! Screen states and the reducer that drives them.

/// State of a list screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewState<T> {
    Loading,
    Success(Vec<T>),
    /// A successful result with no rows.
    Empty,
    Error(String),
}

impl<T> Default for ViewState<T> {
    fn default() -> Self {
        ViewState::Loading
    }
}

impl<T> ViewState<T> {
    pub fn rows(&self) -> &[T] {
        match self {
            ViewState::Success(rows) => rows,
            ViewState::Loading | ViewState::Empty | ViewState::Error(_) => &[],
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, ViewState::Loading)
    }
}

/// Inputs to [`reduce`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent<T> {
    /// An explicit load was requested.
    LoadRequested,
    /// The derived rows changed.
    Rows(Vec<T>),
    /// A failure with no cached fallback.
    Failed(String),
}

/// Next state for `event`.
///
/// No state is terminal: `Error` leaves on the next load request or on the
/// next rows, the same as every other state.
pub fn reduce<T>(state: ViewState<T>, event: ViewEvent<T>) -> ViewState<T> {
    match (state, event) {
        (_, ViewEvent::LoadRequested) => ViewState::Loading,
        (_, ViewEvent::Rows(rows)) if rows.is_empty() => ViewState::Empty,
        (_, ViewEvent::Rows(rows)) => ViewState::Success(rows),
        (_, ViewEvent::Failed(message)) => ViewState::Error(message),
    }
}

/// State of a single-item screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemState<T> {
    Loading,
    Ready(T),
    Error(String),
}

impl<T> Default for ItemState<T> {
    fn default() -> Self {
        ItemState::Loading
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_move_loading_to_success() {
        let state = reduce(ViewState::Loading, ViewEvent::Rows(vec![1, 2]));
        assert_eq!(state, ViewState::Success(vec![1, 2]));
        assert_eq!(state.rows(), &[1, 2]);
    }

    #[test]
    fn test_no_rows_is_empty() {
        let state = reduce(ViewState::Success(vec![1]), ViewEvent::Rows(Vec::<i32>::new()));
        assert_eq!(state, ViewState::Empty);
        assert!(state.rows().is_empty());
    }

    #[test]
    fn test_error_is_not_terminal() {
        let error = reduce(ViewState::<i32>::Loading, ViewEvent::Failed("offline".into()));
        assert_eq!(error, ViewState::Error("offline".to_string()));

        let reloading = reduce(error.clone(), ViewEvent::LoadRequested);
        assert!(reloading.is_loading());

        let recovered = reduce(error, ViewEvent::Rows(vec![3]));
        assert_eq!(recovered, ViewState::Success(vec![3]));
    }

    #[test]
    fn test_background_rows_replace_success() {
        let state = reduce(ViewState::Success(vec![1]), ViewEvent::Rows(vec![4, 5]));
        assert_eq!(state, ViewState::Success(vec![4, 5]));
    }
}
