//! Call entry-level methods on a whole ragged tensor by name.

use std::ops::RangeInclusive;
use std::sync::OnceLock;

use rustc_hash::FxHashMap;

use crate::dispatch::{
    apply_binary, apply_unary, cast, cumsum, reduce, softmax, transpose, Arg, Output, RunOptions,
};
use crate::errors::RaggedError;
use crate::ops::{BinaryOp, Operation, ReduceOp, UnaryOp};
use crate::ragged::RaggedTensor;
use crate::value::{DataType, Scalar, Value};

/// Function which runs a method on every entry of a ragged tensor.
type MethodFunction = fn(&RaggedTensor, &[Arg], &RunOptions) -> Result<Output, RaggedError>;

struct Method {
    /// Operation used to check whether the kernel supports this method.
    op: Operation,

    /// Allowed number of arguments.
    arity: RangeInclusive<usize>,
    run: MethodFunction,
}

/// Return the table of methods, keyed by name.
fn methods() -> &'static FxHashMap<&'static str, Method> {
    static METHODS: OnceLock<FxHashMap<&'static str, Method>> = OnceLock::new();
    METHODS.get_or_init(|| {
        let mut table = FxHashMap::default();

        macro_rules! register {
            ($name:literal, $op:expr, $arity:expr, $run:expr) => {
                table.insert(
                    $name,
                    Method {
                        op: $op,
                        arity: $arity,
                        run: $run,
                    },
                );
            };
        }

        macro_rules! unary {
            ($name:literal, $op:ident) => {
                register!(
                    $name,
                    Operation::Unary(UnaryOp::$op),
                    0..=0,
                    |ragged, _, opts| apply_unary(UnaryOp::$op, ragged, opts).map(Output::Ragged)
                )
            };
        }

        macro_rules! binary {
            ($name:literal, $op:ident) => {
                register!(
                    $name,
                    Operation::Binary(BinaryOp::$op),
                    1..=1,
                    |ragged, args, opts| {
                        apply_binary(BinaryOp::$op, ragged, args[0], opts).map(Output::Ragged)
                    }
                )
            };
        }

        // Reductions accept an optional dimension and `keep_dims` flag.
        macro_rules! reduction {
            ($name:literal, $op:ident) => {
                register!(
                    $name,
                    Operation::Reduce {
                        op: ReduceOp::$op,
                        axis: None,
                        keep_dims: false,
                    },
                    0..=2,
                    |ragged, args, opts| {
                        let dim = args
                            .first()
                            .map(|arg| dim_arg(arg, ragged.ndim()))
                            .transpose()?;
                        let keep_dims = args.get(1).map(bool_arg).transpose()?.unwrap_or(false);
                        reduce(ReduceOp::$op, ragged, dim, keep_dims, None, opts)
                    }
                )
            };
        }

        unary!("neg", Neg);
        unary!("abs", Abs);
        unary!("exp", Exp);
        unary!("log", Log);
        unary!("sqrt", Sqrt);
        unary!("relu", Relu);
        unary!("sigmoid", Sigmoid);
        unary!("tanh", Tanh);
        unary!("sin", Sin);
        unary!("cos", Cos);

        binary!("add", Add);
        binary!("sub", Sub);
        binary!("mul", Mul);
        binary!("div", Div);
        binary!("pow", Pow);
        binary!("maximum", Max);
        binary!("minimum", Min);
        binary!("eq", Equal);
        binary!("ne", NotEqual);
        binary!("clamp_min", Max);
        binary!("clamp_max", Min);

        reduction!("sum", Sum);
        reduction!("mean", Mean);
        reduction!("prod", Prod);
        reduction!("amax", Max);
        reduction!("amin", Min);

        register!(
            "clamp",
            Operation::Binary(BinaryOp::Max),
            2..=2,
            |ragged, args, opts| {
                let lower = apply_binary(BinaryOp::Max, ragged, args[0], opts)?;
                apply_binary(BinaryOp::Min, &lower, args[1], opts).map(Output::Ragged)
            }
        );
        register!(
            "cumsum",
            Operation::CumSum { axis: 0 },
            1..=1,
            |ragged, args, opts| {
                let dim = dim_arg(&args[0], ragged.ndim())?;
                cumsum(ragged, dim, opts).map(Output::Ragged)
            }
        );
        register!(
            "softmax",
            Operation::Softmax { axis: 0 },
            1..=1,
            |ragged, args, opts| {
                let dim = dim_arg(&args[0], ragged.ndim())?;
                softmax(ragged, dim, opts).map(Output::Ragged)
            }
        );
        register!(
            "transpose",
            Operation::Transpose { dim0: 0, dim1: 0 },
            2..=2,
            |ragged, args, opts| {
                let dim0 = dim_arg(&args[0], ragged.ndim())?;
                let dim1 = dim_arg(&args[1], ragged.ndim())?;
                transpose(ragged, dim0, dim1, opts).map(Output::Ragged)
            }
        );
        register!(
            "float",
            Operation::Cast(DataType::Float),
            0..=0,
            |ragged, _, opts| cast(ragged, DataType::Float, opts).map(Output::Ragged)
        );
        register!(
            "int",
            Operation::Cast(DataType::Int32),
            0..=0,
            |ragged, _, opts| cast(ragged, DataType::Int32, opts).map(Output::Ragged)
        );

        table
    })
}

/// Convert a dimension argument, which may be negative to count from the
/// end.
fn dim_arg(arg: &Arg, ndim: usize) -> Result<usize, RaggedError> {
    let Arg::Scalar(Scalar::Int32(dim)) = arg else {
        return Err(RaggedError::InvalidValue(format!(
            "expected an integer dimension but got {:?}",
            arg
        )));
    };
    let resolved = if *dim < 0 {
        ndim as i64 + *dim as i64
    } else {
        *dim as i64
    };
    // Negative dims which are still out of range are reported by magnitude.
    usize::try_from(resolved).map_err(|_| RaggedError::DimensionOutOfRange {
        dim: dim.unsigned_abs() as usize,
        ndim,
    })
}

fn bool_arg(arg: &Arg) -> Result<bool, RaggedError> {
    match arg {
        Arg::Scalar(Scalar::Int32(value)) => Ok(*value != 0),
        _ => Err(RaggedError::InvalidValue(format!(
            "expected a flag but got {:?}",
            arg
        ))),
    }
}

/// View of a ragged tensor which exposes the methods of its entries.
///
/// A method is looked up by name and checked against the first entry, which
/// determines whether the kernel supports it. It is then run across every
/// entry via the functions in [`dispatch`](crate::dispatch). Methods either
/// succeed for every entry or fail as a whole.
///
/// Dimension arguments are passed as integer scalars and refer to dimensions
/// of the ragged tensor. Negative dimensions count from the end.
pub struct Batch<'a> {
    ragged: &'a RaggedTensor,
    representative: &'a Value,
    opts: RunOptions,
}

impl<'a> Batch<'a> {
    /// Create a batch view of a ragged tensor.
    ///
    /// Fails if the tensor has no entries, since methods are looked up on the
    /// first entry.
    pub fn new(ragged: &'a RaggedTensor) -> Result<Batch<'a>, RaggedError> {
        let representative = ragged.get(0).ok_or_else(|| {
            RaggedError::ShapeMismatch("cannot create a batch view of an empty tensor".into())
        })?;
        Ok(Batch {
            ragged,
            representative,
            opts: RunOptions::default(),
        })
    }

    /// Set the options used to dispatch methods.
    pub fn with_options(mut self, opts: RunOptions) -> Self {
        self.opts = opts;
        self
    }

    /// Return the entry used to look up methods.
    pub fn representative(&self) -> &Value {
        self.representative
    }

    /// Return the names of available methods, in sorted order.
    pub fn methods() -> Vec<&'static str> {
        let mut names: Vec<_> = methods().keys().copied().collect();
        names.sort();
        names
    }

    pub fn has_method(name: &str) -> bool {
        methods().contains_key(name)
    }

    /// Run method `name` on every entry.
    pub fn call(&self, name: &str, args: &[Arg]) -> Result<Output, RaggedError> {
        let method = methods()
            .get(name)
            .ok_or_else(|| RaggedError::UnsupportedOperation {
                op: name.to_string(),
                dtype: None,
            })?;

        if !method.arity.contains(&args.len()) {
            return Err(RaggedError::InvalidValue(format!(
                "method {} expects {} to {} arguments but got {}",
                name,
                method.arity.start(),
                method.arity.end(),
                args.len()
            )));
        }

        let dtype = self.representative.dtype();
        if !self.ragged.backend().kernel.supports(&method.op, dtype) {
            return Err(RaggedError::UnsupportedOperation {
                op: method.op.name().to_string(),
                dtype: Some(dtype),
            });
        }

        tracing::debug!(method = name, args = args.len(), "calling batch method");
        (method.run)(self.ragged, args, &self.opts)
    }
}
