//! Where a tiling request reads its run-time shape, reduce axes, and attributes from.
//!
//! Operators reach the tiling engine either through a hand-built op-info record ([OpInfo]) or
//! through their graph description ([GraphOp]). The engine only depends on [ShapeSource].

use auto_impl::auto_impl;
use std::collections::HashMap;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Operator has no input {0}")]
    MissingInput(usize),
    #[error("Operator has no attribute {0:?}")]
    MissingAttr(String),
    #[error("Attribute {0:?} is not an integer list")]
    AttrType(String),
    #[error("Input {0} holding the reduce axes is not a constant")]
    AxesNotConstant(usize),
}

#[auto_impl(&, Box)]
pub trait ShapeSource {
    /// The run-time shape of the reduced tensor. Negative extents mean "unknown".
    fn input_shape(&self) -> Result<Vec<i64>, SourceError>;

    /// The reduce axes, possibly negative.
    fn reduce_axes(&self) -> Result<Vec<i64>, SourceError>;

    /// An integer operator attribute, for profiles declaring extra tiling parameters.
    fn attr(&self, name: &str) -> Option<i64>;

    /// Raw axes which must not be fused with their neighbors.
    fn disable_fuse_axes(&self) -> Vec<i64> {
        Vec::new()
    }
}

/// A custom op-info record built directly by the caller.
#[derive(Debug, Clone, Default)]
pub struct OpInfo {
    pub shape: Vec<i64>,
    pub axes: Vec<i64>,
    pub attrs: HashMap<String, i64>,
    pub disable_fuse_axes: Vec<i64>,
}

impl OpInfo {
    pub fn new(shape: impl Into<Vec<i64>>, axes: impl Into<Vec<i64>>) -> Self {
        OpInfo {
            shape: shape.into(),
            axes: axes.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, name: &str, value: i64) -> Self {
        self.attrs.insert(name.to_string(), value);
        self
    }
}

impl ShapeSource for OpInfo {
    fn input_shape(&self) -> Result<Vec<i64>, SourceError> {
        Ok(self.shape.clone())
    }

    fn reduce_axes(&self) -> Result<Vec<i64>, SourceError> {
        Ok(self.axes.clone())
    }

    fn attr(&self, name: &str) -> Option<i64> {
        self.attrs.get(name).copied()
    }

    fn disable_fuse_axes(&self) -> Vec<i64> {
        self.disable_fuse_axes.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    pub shape: Vec<i64>,
    /// The tensor's value, when it is a compile-time constant.
    pub const_value: Option<Vec<i64>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Int(i64),
    Ints(Vec<i64>),
    Bool(bool),
}

/// Where a graph operator keeps its reduce axes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxesFrom {
    Attr(String),
    Input(usize),
}

/// An operator node of the graph. The reduced tensor is input 0.
#[derive(Debug, Clone)]
pub struct GraphOp {
    pub inputs: Vec<TensorDesc>,
    pub attrs: HashMap<String, AttrValue>,
    pub axes_from: AxesFrom,
}

impl ShapeSource for GraphOp {
    fn input_shape(&self) -> Result<Vec<i64>, SourceError> {
        self.inputs
            .first()
            .map(|t| t.shape.clone())
            .ok_or(SourceError::MissingInput(0))
    }

    fn reduce_axes(&self) -> Result<Vec<i64>, SourceError> {
        match &self.axes_from {
            AxesFrom::Attr(name) => match self.attrs.get(name) {
                Some(AttrValue::Ints(v)) => Ok(v.clone()),
                Some(AttrValue::Int(v)) => Ok(vec![*v]),
                Some(AttrValue::Bool(_)) => Err(SourceError::AttrType(name.clone())),
                None => Err(SourceError::MissingAttr(name.clone())),
            },
            AxesFrom::Input(idx) => {
                let input = self
                    .inputs
                    .get(*idx)
                    .ok_or(SourceError::MissingInput(*idx))?;
                input
                    .const_value
                    .clone()
                    .ok_or(SourceError::AxesNotConstant(*idx))
            }
        }
    }

    fn attr(&self, name: &str) -> Option<i64> {
        match self.attrs.get(name)? {
            AttrValue::Int(v) => Some(*v),
            AttrValue::Bool(b) => Some(i64::from(*b)),
            AttrValue::Ints(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_op(axes_from: AxesFrom) -> GraphOp {
        GraphOp {
            inputs: vec![
                TensorDesc {
                    shape: vec![8, 16, 32],
                    const_value: None,
                },
                TensorDesc {
                    shape: vec![2],
                    const_value: Some(vec![0, -1]),
                },
            ],
            attrs: HashMap::from([
                ("axes".to_string(), AttrValue::Ints(vec![1])),
                ("keep_dims".to_string(), AttrValue::Bool(true)),
                ("alpha".to_string(), AttrValue::Int(3)),
            ]),
            axes_from,
        }
    }

    #[test]
    fn test_op_info_reports_its_fields() {
        let info = OpInfo::new([4, 5], [-1]).with_attr("alpha", 7);
        assert_eq!(info.input_shape().unwrap(), vec![4, 5]);
        assert_eq!(info.reduce_axes().unwrap(), vec![-1]);
        assert_eq!(info.attr("alpha"), Some(7));
        assert_eq!(info.attr("beta"), None);
    }

    #[test]
    fn test_graph_op_reads_axes_from_attr() {
        let op = graph_op(AxesFrom::Attr("axes".to_string()));
        assert_eq!(op.input_shape().unwrap(), vec![8, 16, 32]);
        assert_eq!(op.reduce_axes().unwrap(), vec![1]);
        assert_eq!(op.attr("keep_dims"), Some(1));
        assert_eq!(op.attr("alpha"), Some(3));
        assert_eq!(op.attr("axes"), None);
    }

    #[test]
    fn test_graph_op_reads_axes_from_const_input() {
        let op = graph_op(AxesFrom::Input(1));
        assert_eq!(op.reduce_axes().unwrap(), vec![0, -1]);
    }

    #[test]
    fn test_graph_op_errors() {
        let mut op = graph_op(AxesFrom::Input(1));
        op.inputs[1].const_value = None;
        assert_eq!(op.reduce_axes(), Err(SourceError::AxesNotConstant(1)));

        let op = graph_op(AxesFrom::Input(4));
        assert_eq!(op.reduce_axes(), Err(SourceError::MissingInput(4)));

        let op = graph_op(AxesFrom::Attr("dims".to_string()));
        assert_eq!(
            op.reduce_axes(),
            Err(SourceError::MissingAttr("dims".to_string()))
        );

        let op = graph_op(AxesFrom::Attr("keep_dims".to_string()));
        assert_eq!(
            op.reduce_axes(),
            Err(SourceError::AttrType("keep_dims".to_string()))
        );
    }

    #[test]
    fn test_sources_work_through_references() {
        fn shape_of(source: impl ShapeSource) -> Vec<i64> {
            source.input_shape().unwrap()
        }
        let info = OpInfo::new([3], [0]);
        assert_eq!(shape_of(&info), vec![3]);
        assert_eq!(shape_of(Box::new(info)), vec![3]);
    }
}
