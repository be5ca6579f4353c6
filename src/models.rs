/// A single search hit: enough to show the user and to open a stream later.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
}

/// A live audio stream together with a tag describing its format.
pub struct OpenedStream<S> {
    pub stream: S,
    pub format: String,
}

/// A resolved, playable song. The stream is consumed when the track starts.
pub struct Song<S> {
    pub title: String,
    pub url: String,
    pub format: String,
    pub gain: f32,
    pub(crate) stream: Option<S>,
}

impl<S> Song<S> {
    pub fn new(result: SearchResult, opened: OpenedStream<S>) -> Self {
        Self {
            title: result.title,
            url: result.url,
            format: opened.format,
            gain: 1.0,
            stream: Some(opened.stream),
        }
    }
}
