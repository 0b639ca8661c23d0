use crate::buffer::BoundedChannel;
use crate::error::{PipelineError, Result};
use crate::metrics::NodeMetrics;
use crate::node::{NodeContext, PipelineNode, Ports};
use crate::sink::ErrorRecord;
use std::marker::PhantomData;
use tracing::debug;

/// Output handle given to a source while it generates records
pub struct Emitter<'a, T> {
    channel: &'a BoundedChannel<T>,
    errors: Option<&'a BoundedChannel<ErrorRecord<T>>>,
    metrics: &'a NodeMetrics,
}

impl<'a, T> Emitter<'a, T> {
    pub fn new(channel: &'a BoundedChannel<T>, metrics: &'a NodeMetrics) -> Self {
        Self {
            channel,
            errors: None,
            metrics,
        }
    }

    /// Route rejected records to `errors`
    pub fn with_errors(mut self, errors: Option<&'a BoundedChannel<ErrorRecord<T>>>) -> Self {
        self.errors = errors;
        self
    }

    /// Put a record on the output, blocking while it is full
    pub fn emit(&self, record: T) -> Result<()> {
        self.channel.put(record)?;
        self.metrics.record_processed(1);
        Ok(())
    }

    /// Reject a record the source could not produce cleanly.
    ///
    /// With an error output attached the record is redirected there and the
    /// source keeps going; otherwise `error` is returned and faults the node.
    pub fn reject(&self, record: T, error: PipelineError) -> Result<()> {
        match self.errors {
            Some(errors) => {
                debug!(node = self.metrics.node(), error = %error, "record redirected");
                errors.put(ErrorRecord { record, error })?;
                self.metrics.record_redirected(1);
                Ok(())
            }
            None => Err(error),
        }
    }
}

/// A node that produces records
pub trait Source: Send + 'static {
    type Output: Send + 'static;

    /// Get a human-readable name for this source
    fn name(&self) -> &str {
        "source"
    }

    /// Called before streaming starts
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Produce every record. Returning ends the stream.
    fn generate(&mut self, output: &Emitter<'_, Self::Output>) -> Result<()>;

    /// Called once when the source stops, on success or failure
    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A node that maps each input record to zero or more output records
pub trait Transform: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Get a human-readable name for this transform
    fn name(&self) -> &str {
        "transform"
    }

    /// Called before streaming starts
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Process an input record and produce output(s)
    fn process(&mut self, input: Self::Input) -> Result<Vec<Self::Output>>;

    /// Produce trailing records once the input has completed
    fn finish(&mut self) -> Result<Vec<Self::Output>> {
        Ok(Vec::new())
    }

    /// Called once when the transform stops, on success or failure
    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Runs a `Source` as a pipeline node
pub struct SourceNode<S: Source> {
    source: S,
    output: BoundedChannel<S::Output>,
    errors: Option<BoundedChannel<ErrorRecord<S::Output>>>,
}

impl<S: Source> SourceNode<S> {
    pub fn new(source: S, output: BoundedChannel<S::Output>) -> Self {
        Self {
            source,
            output,
            errors: None,
        }
    }

    pub fn output(&self) -> &BoundedChannel<S::Output> {
        &self.output
    }

    /// Receive records rejected through `Emitter::reject` on `channel`
    pub fn with_error_output(mut self, channel: BoundedChannel<ErrorRecord<S::Output>>) -> Self {
        self.errors = Some(channel);
        self
    }

    /// Attach an unbounded error output and return it
    pub fn attach_error_output(&mut self) -> BoundedChannel<ErrorRecord<S::Output>> {
        self.errors
            .get_or_insert_with(BoundedChannel::unbounded)
            .clone()
    }
}

impl<S: Source> PipelineNode for SourceNode<S> {
    fn name(&self) -> &str {
        self.source.name()
    }

    fn ports(&self) -> Ports {
        Ports::new()
            .output(&self.output)
            .error_output(self.errors.as_ref())
    }

    fn setup(&mut self) -> Result<()> {
        self.source.setup()
    }

    fn stream_main(&mut self, ctx: &NodeContext) -> Result<()> {
        let emitter = Emitter::new(&self.output, ctx.metrics()).with_errors(self.errors.as_ref());
        self.source.generate(&emitter)
    }

    fn cleanup(&mut self) -> Result<()> {
        self.source.cleanup()
    }
}

/// Error output of a transform, with the copy kept of each input so a
/// failed record can still be redirected after `process` consumed it
struct Redirect<R> {
    channel: BoundedChannel<ErrorRecord<R>>,
    keep: fn(&R) -> R,
}

/// Runs a `Transform` between two channels
pub struct TransformNode<T: Transform> {
    transform: T,
    input: BoundedChannel<T::Input>,
    output: BoundedChannel<T::Output>,
    errors: Option<Redirect<T::Input>>,
}

impl<T: Transform> TransformNode<T> {
    pub fn new(
        transform: T,
        input: BoundedChannel<T::Input>,
        output: BoundedChannel<T::Output>,
    ) -> Self {
        Self {
            transform,
            input,
            output,
            errors: None,
        }
    }

    pub fn output(&self) -> &BoundedChannel<T::Output> {
        &self.output
    }

    /// Process one record. `None` means it was redirected to the error output.
    fn process(&mut self, record: T::Input, ctx: &NodeContext) -> Result<Option<Vec<T::Output>>> {
        let Some(redirect) = &self.errors else {
            return self.transform.process(record).map(Some);
        };
        let kept = (redirect.keep)(&record);
        match self.transform.process(record) {
            Ok(outputs) => Ok(Some(outputs)),
            Err(error) => {
                debug!(node = ctx.name(), error = %error, "record redirected");
                redirect.channel.put(ErrorRecord {
                    record: kept,
                    error,
                })?;
                ctx.metrics().record_redirected(1);
                Ok(None)
            }
        }
    }
}

impl<T> TransformNode<T>
where
    T: Transform,
    T::Input: Clone,
{
    /// Redirect records that `process` fails on to `channel` instead of
    /// faulting. Every input is cloned before processing.
    pub fn with_error_output(mut self, channel: BoundedChannel<ErrorRecord<T::Input>>) -> Self {
        self.errors = Some(Redirect {
            channel,
            keep: <T::Input as Clone>::clone,
        });
        self
    }

    /// Attach an unbounded error output and return it
    pub fn attach_error_output(&mut self) -> BoundedChannel<ErrorRecord<T::Input>> {
        self.errors
            .get_or_insert_with(|| Redirect {
                channel: BoundedChannel::unbounded(),
                keep: <T::Input as Clone>::clone,
            })
            .channel
            .clone()
    }
}

impl<T: Transform> PipelineNode for TransformNode<T> {
    fn name(&self) -> &str {
        self.transform.name()
    }

    fn ports(&self) -> Ports {
        Ports::new()
            .input(&self.input)
            .output(&self.output)
            .error_output(self.errors.as_ref().map(|redirect| &redirect.channel))
    }

    fn setup(&mut self) -> Result<()> {
        self.transform.setup()
    }

    fn stream_main(&mut self, ctx: &NodeContext) -> Result<()> {
        while let Some(record) = self.input.take()? {
            let Some(outputs) = self.process(record, ctx)? else {
                continue;
            };
            for output in outputs {
                self.output.put(output)?;
            }
            ctx.metrics().record_processed(1);
        }
        for output in self.transform.finish()? {
            self.output.put(output)?;
        }
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        self.transform.cleanup()
    }
}

/// A source that emits every item of an iterator
pub struct IterSource<I: Iterator> {
    name: String,
    items: Option<I>,
}

impl<I> IterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    /// Create a new iterator source
    pub fn new(name: impl Into<String>, items: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            name: name.into(),
            items: Some(items.into_iter()),
        }
    }
}

impl<I> Source for IterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    type Output = I::Item;

    fn name(&self) -> &str {
        &self.name
    }

    fn generate(&mut self, output: &Emitter<'_, I::Item>) -> Result<()> {
        if let Some(items) = self.items.take() {
            for item in items {
                output.emit(item)?;
            }
        }
        Ok(())
    }
}

/// A pass-through transform
#[derive(Debug)]
pub struct Passthrough<T> {
    name: String,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> Passthrough<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> Transform for Passthrough<T> {
    type Input = T;
    type Output = T;

    fn process(&mut self, input: T) -> Result<Vec<T>> {
        Ok(vec![input])
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A filtering transform that passes through records matching a predicate
pub struct Filter<T, F>
where
    F: Fn(&T) -> bool + Send + 'static,
{
    name: String,
    predicate: F,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T, F> Filter<T, F>
where
    F: Fn(&T) -> bool + Send + 'static,
{
    /// Create a new filter transform
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self {
            name: name.into(),
            predicate,
            _marker: PhantomData,
        }
    }
}

impl<T, F> Transform for Filter<T, F>
where
    T: Send + 'static,
    F: Fn(&T) -> bool + Send + 'static,
{
    type Input = T;
    type Output = T;

    fn process(&mut self, input: T) -> Result<Vec<T>> {
        if (self.predicate)(&input) {
            Ok(vec![input])
        } else {
            Ok(vec![])
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A mapping transform that converts each record
pub struct Map<I, O, F>
where
    F: FnMut(I) -> Result<O> + Send + 'static,
{
    name: String,
    mapper: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F> Map<I, O, F>
where
    F: FnMut(I) -> Result<O> + Send + 'static,
{
    /// Create a new map transform
    pub fn new(name: impl Into<String>, mapper: F) -> Self {
        Self {
            name: name.into(),
            mapper,
            _marker: PhantomData,
        }
    }
}

impl<I, O, F> Transform for Map<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: FnMut(I) -> Result<O> + Send + 'static,
{
    type Input = I;
    type Output = O;

    fn process(&mut self, input: I) -> Result<Vec<O>> {
        Ok(vec![(self.mapper)(input)?])
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    #[test]
    fn test_passthrough() {
        let mut stage = Passthrough::new("pass");
        assert_eq!(stage.process(vec![1, 2, 3]).unwrap(), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_filter() {
        let mut stage = Filter::new("test_filter", |n: &u32| *n > 5);
        assert_eq!(stage.process(3).unwrap().len(), 0);
        assert_eq!(stage.process(7).unwrap(), vec![7]);
    }

    #[test]
    fn test_map() {
        let mut stage = Map::new("double", |n: u32| Ok(n * 2));
        assert_eq!(stage.process(5).unwrap(), vec![10]);

        let mut failing = Map::new("fail", |_: u32| -> Result<u32> {
            Err(PipelineError::StageError("nope".into()))
        });
        assert!(failing.process(1).is_err());
    }

    #[test]
    fn test_source_node_emits_and_counts() {
        let output = BoundedChannel::unbounded();
        let mut node = SourceNode::new(IterSource::new("numbers", 1..=4), output.clone());
        let ctx = NodeContext::new("numbers", NodeMetrics::new("numbers"));

        node.stream_main(&ctx).unwrap();
        output.complete();
        assert_eq!(output.collect().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(ctx.metrics().total_processed(), 4);
        assert_eq!(node.name(), "numbers");
    }

    struct Summer {
        total: u64,
    }

    impl Transform for Summer {
        type Input = u64;
        type Output = u64;

        fn process(&mut self, input: u64) -> Result<Vec<u64>> {
            self.total += input;
            Ok(vec![])
        }

        fn finish(&mut self) -> Result<Vec<u64>> {
            Ok(vec![self.total])
        }
    }

    #[test]
    fn test_transform_node_finish_emits_trailing_output() {
        let input = BoundedChannel::unbounded();
        let output = BoundedChannel::unbounded();
        for i in 1..=4u64 {
            input.put(i).unwrap();
        }
        input.complete();

        let mut node = TransformNode::new(Summer { total: 0 }, input, output.clone());
        let ctx = NodeContext::new("sum", NodeMetrics::new("sum"));
        node.stream_main(&ctx).unwrap();
        output.complete();

        assert_eq!(output.collect().unwrap(), vec![10]);
        assert_eq!(node.name(), "transform");
    }

    fn rejects_odd(n: u32) -> Result<u32> {
        if n % 2 == 1 {
            Err(PipelineError::StageError(format!("odd: {n}")))
        } else {
            Ok(n * 10)
        }
    }

    #[test]
    fn test_transform_node_redirects_failed_records() {
        let input = BoundedChannel::unbounded();
        let output = BoundedChannel::unbounded();
        for i in 1..=4u32 {
            input.put(i).unwrap();
        }
        input.complete();

        let mut node = TransformNode::new(Map::new("even", rejects_odd), input, output.clone());
        let errors = node.attach_error_output();
        assert!(node.ports().error_output.is_some());
        let ctx = NodeContext::new("even", NodeMetrics::new("even"));

        node.stream_main(&ctx).unwrap();
        output.complete();
        errors.complete();

        assert_eq!(output.collect().unwrap(), vec![20, 40]);
        let rejected: Vec<u32> = errors.collect().unwrap().into_iter().map(|e| e.record).collect();
        assert_eq!(rejected, vec![1, 3]);
        assert_eq!(ctx.metrics().total_processed(), 2);
        assert_eq!(ctx.metrics().total_redirected(), 2);
    }

    #[test]
    fn test_transform_node_without_error_output_faults() {
        let input = BoundedChannel::unbounded();
        let output = BoundedChannel::unbounded();
        input.put(2u32).unwrap();
        input.put(3u32).unwrap();
        input.complete();

        let mut node = TransformNode::new(Map::new("even", rejects_odd), input, output.clone());
        assert!(node.ports().error_output.is_none());
        let ctx = NodeContext::new("even", NodeMetrics::new("even"));

        let err = node.stream_main(&ctx).unwrap_err();
        assert!(matches!(err, PipelineError::StageError(_)));
        assert_eq!(output.try_take(), Some(20));
    }

    struct Checked {
        values: Vec<i64>,
    }

    impl Source for Checked {
        type Output = i64;

        fn generate(&mut self, output: &Emitter<'_, i64>) -> Result<()> {
            for value in self.values.drain(..) {
                if value < 0 {
                    output.reject(value, PipelineError::StageError("negative".into()))?;
                } else {
                    output.emit(value)?;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_source_node_rejects_to_error_output() {
        let output = BoundedChannel::unbounded();
        let mut node = SourceNode::new(
            Checked {
                values: vec![1, -2, 3],
            },
            output.clone(),
        );
        let errors = node.attach_error_output();
        let ctx = NodeContext::new("checked", NodeMetrics::new("checked"));

        node.stream_main(&ctx).unwrap();
        output.complete();
        errors.complete();

        assert_eq!(output.collect().unwrap(), vec![1, 3]);
        let rejected = errors.collect().unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].record, -2);
        assert_eq!(ctx.metrics().total_redirected(), 1);
    }

    #[test]
    fn test_source_reject_without_error_output_fails() {
        let output = BoundedChannel::unbounded();
        let mut node = SourceNode::new(
            Checked {
                values: vec![1, -2, 3],
            },
            output.clone(),
        );
        let ctx = NodeContext::new("checked", NodeMetrics::new("checked"));

        assert!(node.stream_main(&ctx).is_err());
        output.complete();
        assert_eq!(output.collect().unwrap(), vec![1]);
    }
}
