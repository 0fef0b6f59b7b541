//! Tracking state machine states.

/// State of the tracking thread.
///
/// Every transition is observable: the tracker exposes both the current
/// state and the state the previous frame finished in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// Construction has not finished.
    #[default]
    SystemNotReady,
    /// Ready, but no frame has arrived yet.
    NoImagesYet,
    /// Frames are arriving but the map has not been initialized.
    NotInitialized,
    /// Tracking normally.
    Ok,
    /// No pose could be produced for the last frame.
    Lost,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state() {
        assert_eq!(TrackingState::default(), TrackingState::SystemNotReady);
    }
}
