//! Per-series evaluation of log lines: the seams through which queries plug their logic in.

use std::sync::Arc;

use crate::{Labels, TimeInt};

/// The output of a [`StreamPipeline`] for one line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessedLine {
    pub line: Arc<str>,

    /// Labels for this line only, if the pipeline changed them.
    pub labels: Option<Labels>,
}

/// A compiled log query, to be bound to each series it runs on.
pub trait Pipeline: Send + Sync {
    /// `labels` never contain [`crate::METRIC_NAME_LABEL`].
    fn for_stream(&self, labels: &Labels) -> Box<dyn StreamPipeline>;
}

/// A [`Pipeline`] bound to a single series.
pub trait StreamPipeline: Send {
    fn base_labels(&self) -> &Labels;

    /// Returns `None` if the line is filtered out.
    fn process(&mut self, timestamp: TimeInt, line: &str) -> Option<ProcessedLine>;
}

/// The output of a [`StreamSampleExtractor`] for one line.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractedSample {
    pub value: f64,
    pub labels: Option<Labels>,
}

/// A compiled metric query, to be bound to each series it runs on.
pub trait SampleExtractor: Send + Sync {
    /// `labels` never contain [`crate::METRIC_NAME_LABEL`].
    fn for_stream(&self, labels: &Labels) -> Box<dyn StreamSampleExtractor>;
}

/// A [`SampleExtractor`] bound to a single series.
pub trait StreamSampleExtractor: Send {
    fn base_labels(&self) -> &Labels;

    /// Returns `None` if the line yields no sample.
    fn process(&mut self, timestamp: TimeInt, line: &str) -> Option<ExtractedSample>;
}

/// Excludes whole series based on their labels.
pub trait Filterer: Send + Sync {
    /// Returns `true` if the series must be dropped.
    fn should_filter(&self, labels: &Labels) -> bool;
}

impl<F> Filterer for F
where
    F: Fn(&Labels) -> bool + Send + Sync,
{
    #[inline]
    fn should_filter(&self, labels: &Labels) -> bool {
        self(labels)
    }
}

// --- Pipelines ---

/// Keeps every line as-is.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityPipeline;

impl Pipeline for IdentityPipeline {
    fn for_stream(&self, labels: &Labels) -> Box<dyn StreamPipeline> {
        Box::new(LineFilterStream {
            labels: labels.clone(),
            needle: None,
        })
    }
}

/// Keeps the lines containing a given substring, like a `|=` line filter.
#[derive(Clone, Debug)]
pub struct LineContainsPipeline {
    needle: Arc<str>,
}

impl LineContainsPipeline {
    pub fn new(needle: impl Into<Arc<str>>) -> Self {
        Self {
            needle: needle.into(),
        }
    }
}

impl Pipeline for LineContainsPipeline {
    fn for_stream(&self, labels: &Labels) -> Box<dyn StreamPipeline> {
        Box::new(LineFilterStream {
            labels: labels.clone(),
            needle: Some(self.needle.clone()),
        })
    }
}

struct LineFilterStream {
    labels: Labels,
    needle: Option<Arc<str>>,
}

impl StreamPipeline for LineFilterStream {
    fn base_labels(&self) -> &Labels {
        &self.labels
    }

    fn process(&mut self, _timestamp: TimeInt, line: &str) -> Option<ProcessedLine> {
        if let Some(needle) = &self.needle
            && !line.contains(needle.as_ref())
        {
            return None;
        }

        Some(ProcessedLine {
            line: line.into(),
            labels: None,
        })
    }
}

// --- Extractors ---

/// One sample of value `1.0` per line, as used by `count_over_time`.
#[derive(Clone, Copy, Debug, Default)]
pub struct CountOverTimeExtractor;

impl SampleExtractor for CountOverTimeExtractor {
    fn for_stream(&self, labels: &Labels) -> Box<dyn StreamSampleExtractor> {
        Box::new(LineSampleStream {
            labels: labels.clone(),
            extract: |_| 1.0,
        })
    }
}

/// One sample per line, valued with the length of the line in bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct LineLengthExtractor;

impl SampleExtractor for LineLengthExtractor {
    fn for_stream(&self, labels: &Labels) -> Box<dyn StreamSampleExtractor> {
        Box::new(LineSampleStream {
            labels: labels.clone(),
            extract: |line| line.len() as f64,
        })
    }
}

struct LineSampleStream {
    labels: Labels,
    extract: fn(&str) -> f64,
}

impl StreamSampleExtractor for LineSampleStream {
    fn base_labels(&self) -> &Labels {
        &self.labels
    }

    fn process(&mut self, _timestamp: TimeInt, line: &str) -> Option<ExtractedSample> {
        Some(ExtractedSample {
            value: (self.extract)(line),
            labels: None,
        })
    }
}
