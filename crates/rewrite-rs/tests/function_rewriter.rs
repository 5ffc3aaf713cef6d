mod common;

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use anyhow::{bail, Result};
use rewrite_rs::context;
use rewrite_rs::function::BinaryTensorArgs;
use rewrite_rs::{
    FunctionRewriter, RewriteConfig, RewriteContext, RewriteError, RewriteKind, RewriterContext,
    SymbolTable, Tensor,
};
use serde_json::json;

use common::{assert_close, init_tracing, x, y};

type BinaryCtx<'a> = RewriteContext<'a, BinaryTensorArgs, Tensor>;

fn add(symbols: &SymbolTable) -> Result<Tensor> {
    symbols.call::<BinaryTensorArgs, Tensor>("tensor.add", (x(), y()))
}

fn mul(symbols: &SymbolTable) -> Result<Tensor> {
    symbols.call::<BinaryTensorArgs, Tensor>("tensor.mul", (x(), y()))
}

fn sub_func(ctx: &BinaryCtx<'_>, (lhs, rhs): BinaryTensorArgs) -> Result<Tensor> {
    assert_eq!(ctx.backend().as_str(), "tensorrt");
    lhs.sub(&rhs)
}

fn mul_func(_ctx: &BinaryCtx<'_>, (lhs, rhs): BinaryTensorArgs) -> Result<Tensor> {
    lhs.mul(&rhs)
}

fn origin_plus_one(ctx: &BinaryCtx<'_>, args: BinaryTensorArgs) -> Result<Tensor> {
    Ok(ctx.origin_func(args)?.add_scalar(1.0))
}

fn scope<'r>(
    backend: &str,
    rewriter: &'r FunctionRewriter,
    symbols: &'r SymbolTable,
) -> RewriterContext<'r> {
    RewriterContext::new(RewriteConfig::default())
        .backend(backend)
        .rewrite_functions(rewriter, symbols)
}

fn rewrite_error(err: &anyhow::Error) -> &RewriteError {
    err.downcast_ref::<RewriteError>()
        .unwrap_or_else(|| panic!("expected a rewrite error, got {err:#}"))
}

#[test]
fn exact_backend_rewrite_applies_inside_scope_only() -> Result<()> {
    init_tracing();
    let symbols = SymbolTable::with_tensor_ops();
    let rewriter = FunctionRewriter::new();
    rewriter
        .register("tensor.mul", "tensorrt", sub_func)
        .register("tensor.add", "tensorrt", sub_func);

    let expected = x().sub(&y())?;
    {
        let _guard = scope("tensorrt", &rewriter, &symbols).enter()?;
        assert_close(&add(&symbols)?, &expected);
        assert_close(&mul(&symbols)?, &expected);
    }

    assert_close(&add(&symbols)?, &x().add(&y())?);
    assert_close(&mul(&symbols)?, &x().mul(&y())?);

    let _guard = scope("default", &rewriter, &symbols).enter()?;
    assert_close(&add(&symbols)?, &x().add(&y())?);
    Ok(())
}

#[test]
fn default_entry_serves_unregistered_backends() -> Result<()> {
    init_tracing();
    let symbols = SymbolTable::with_tensor_ops();
    let rewriter = FunctionRewriter::new();
    rewriter.register("tensor.add", "default", mul_func);

    let product = x().mul(&y())?;
    scope("tensorrt", &rewriter, &symbols).run(|| {
        assert_close(&add(&symbols)?, &product);
        Ok(())
    })?;
    assert_close(&add(&symbols)?, &x().add(&y())?);

    scope("default", &rewriter, &symbols).run(|| {
        assert_close(&add(&symbols)?, &product);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn exact_entry_beats_default_entry() -> Result<()> {
    let symbols = SymbolTable::with_tensor_ops();
    let rewriter = FunctionRewriter::new();
    rewriter
        .register("tensor.add", "default", mul_func)
        .register("tensor.add", "tensorrt", sub_func);

    scope("tensorrt", &rewriter, &symbols).run(|| {
        assert_close(&add(&symbols)?, &x().sub(&y())?);
        Ok(())
    })?;
    scope("ncnn", &rewriter, &symbols).run(|| {
        assert_close(&add(&symbols)?, &x().mul(&y())?);
        Ok(())
    })
}

#[test]
fn origin_func_calls_the_replaced_implementation() -> Result<()> {
    let symbols = SymbolTable::with_tensor_ops();
    let rewriter = FunctionRewriter::new();
    rewriter.register("tensor.add", "default", origin_plus_one);

    let _guard = scope("default", &rewriter, &symbols).enter()?;
    assert_close(&add(&symbols)?, &x().add(&y())?.add_scalar(1.0));
    Ok(())
}

#[test]
fn nested_scopes_compose_and_unwind_in_order() -> Result<()> {
    init_tracing();
    let symbols = SymbolTable::with_tensor_ops();
    let outer_rewriter = FunctionRewriter::new();
    outer_rewriter.register("tensor.add", "default", mul_func);
    let inner_rewriter = FunctionRewriter::new();
    inner_rewriter.register("tensor.add", "default", origin_plus_one);

    let product = x().mul(&y())?;
    assert_eq!(context::depth(), 0);
    {
        let _outer = scope("default", &outer_rewriter, &symbols).enter()?;
        assert_close(&add(&symbols)?, &product);
        {
            let _inner = scope("default", &inner_rewriter, &symbols).enter()?;
            assert_eq!(context::depth(), 2);
            assert_close(&add(&symbols)?, &product.add_scalar(1.0));
        }
        assert_eq!(context::depth(), 1);
        assert_close(&add(&symbols)?, &product);
    }
    assert_eq!(context::depth(), 0);
    assert_close(&add(&symbols)?, &x().add(&y())?);
    Ok(())
}

#[test]
fn inner_scope_does_not_inherit_outer_backend() -> Result<()> {
    let symbols = SymbolTable::with_tensor_ops();
    let rewriter = FunctionRewriter::new();
    rewriter.register("tensor.add", "tensorrt", sub_func);

    let _outer = scope("tensorrt", &rewriter, &symbols).enter()?;
    let _inner = RewriterContext::new(RewriteConfig::default()).enter()?;
    assert_eq!(context::current_backend().as_str(), "default");
    // The outer activation stays live underneath.
    assert_close(&add(&symbols)?, &x().sub(&y())?);
    Ok(())
}

#[test]
fn rewrites_for_undefined_symbols_fail_on_entry() {
    let symbols = SymbolTable::with_tensor_ops();
    let rewriter = FunctionRewriter::new();
    rewriter
        .register("tensor.add", "default", mul_func)
        .register("tensor.pow", "default", mul_func);

    let err = match scope("default", &rewriter, &symbols).enter() {
        Ok(_) => panic!("entering with an undefined symbol should fail"),
        Err(err) => err,
    };
    match err {
        RewriteError::UnresolvedSymbol { kind, identity } => {
            assert_eq!(kind, RewriteKind::Function);
            assert_eq!(identity, "tensor.pow");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(context::depth(), 0);
}

#[test]
fn strict_mode_rejects_unknown_backends() -> Result<()> {
    let symbols = SymbolTable::with_tensor_ops();
    let rewriter = FunctionRewriter::new();
    rewriter.register("tensor.add", "tensorrt", sub_func);

    let strict = scope("ncnn", &rewriter, &symbols).strict(true).enter();
    assert!(matches!(strict, Err(RewriteError::UnknownBackend { .. })));
    assert_eq!(context::depth(), 0);

    drop(scope("ncnn", &rewriter, &symbols).strict(false).enter()?);
    drop(scope("default", &rewriter, &symbols).strict(true).enter()?);
    drop(scope("tensorrt", &rewriter, &symbols).strict(true).enter()?);
    Ok(())
}

#[test]
fn mismatched_call_signatures_are_reported() -> Result<()> {
    let symbols = SymbolTable::with_tensor_ops();
    let err = symbols
        .call::<(f32, f32), f32>("tensor.add", (1.0, 2.0))
        .unwrap_err();
    assert!(matches!(
        rewrite_error(&err),
        RewriteError::SignatureMismatch { .. }
    ));

    symbols.define("scalar.add", |(a, b): (f32, f32)| Ok(a + b));
    let rewriter = FunctionRewriter::new();
    rewriter.register("scalar.add", "default", mul_func);
    let _guard = scope("default", &rewriter, &symbols).enter()?;
    let err = symbols
        .call::<(f32, f32), f32>("scalar.add", (1.0, 2.0))
        .unwrap_err();
    match rewrite_error(&err) {
        RewriteError::SignatureMismatch { identity, .. } => assert_eq!(identity, "scalar.add"),
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[test]
fn scope_exits_on_error_and_panic() -> Result<()> {
    let symbols = SymbolTable::with_tensor_ops();
    let rewriter = FunctionRewriter::new();
    rewriter.register("tensor.add", "default", mul_func);

    let result: Result<()> = scope("default", &rewriter, &symbols).run(|| bail!("export failed"));
    assert!(result.is_err());
    assert_eq!(context::depth(), 0);

    let unwound = panic::catch_unwind(AssertUnwindSafe(|| {
        let _guard = scope("default", &rewriter, &symbols)
            .enter()
            .expect("scope should enter");
        panic!("rewrite blew up");
    }));
    assert!(unwound.is_err());
    assert_eq!(context::depth(), 0);
    assert_close(&add(&symbols)?, &x().add(&y())?);
    Ok(())
}

#[test]
fn rewrites_see_config_and_extra_fields() -> Result<()> {
    let symbols = SymbolTable::with_tensor_ops();
    let rewriter = FunctionRewriter::new();
    rewriter.register(
        "tensor.add",
        "tensorrt",
        |ctx: &BinaryCtx<'_>, (lhs, rhs): BinaryTensorArgs| {
            assert_eq!(ctx.identity(), "tensor.add");
            let factor = ctx.cfg().get_as::<f32>("/codebase_config/scale")?.unwrap_or(1.0);
            let shift = ctx
                .extra("shift")
                .and_then(|value| value.as_f64())
                .unwrap_or(0.0) as f32;
            Ok(lhs.add(&rhs)?.scale(factor).add_scalar(shift))
        },
    );

    let cfg = RewriteConfig::new(json!({
        "backend_config": { "type": "TensorRT" },
        "codebase_config": { "scale": 2.0 }
    }))?;
    let _guard = RewriterContext::new(cfg)
        .extra("shift", json!(0.5))
        .rewrite_functions(&rewriter, &symbols)
        .enter()?;

    let current = context::current().expect("scope should be active");
    assert_eq!(current.backend().as_str(), "tensorrt");
    assert_eq!(current.extra("shift"), Some(&json!(0.5)));
    assert_close(&add(&symbols)?, &x().add(&y())?.scale(2.0).add_scalar(0.5));
    Ok(())
}

#[test]
fn scopes_are_isolated_per_thread() -> Result<()> {
    let symbols = SymbolTable::with_tensor_ops();
    let rewriter = FunctionRewriter::new();
    rewriter.register("tensor.add", "default", mul_func);

    let _guard = scope("default", &rewriter, &symbols).enter()?;
    let from_other_thread = thread::scope(|s| s.spawn(|| add(&symbols)).join())
        .expect("worker thread panicked")?;
    assert_close(&from_other_thread, &x().add(&y())?);
    assert_close(&add(&symbols)?, &x().mul(&y())?);
    Ok(())
}

#[test]
fn unregistered_symbols_run_unmodified() -> Result<()> {
    let symbols = SymbolTable::with_tensor_ops();
    let rewriter = FunctionRewriter::new();
    rewriter.register("tensor.add", "default", mul_func);
    assert!(rewriter.remove("tensor.add", "default"));
    assert!(rewriter.identities().is_empty());

    let _guard = scope("default", &rewriter, &symbols).enter()?;
    assert_close(&add(&symbols)?, &x().add(&y())?);
    assert_close(
        &symbols.call::<BinaryTensorArgs, Tensor>("tensor.div", (y(), x()))?,
        &Tensor::vector(vec![2.0; 5]),
    );
    Ok(())
}

#[test]
fn rewriters_bound_to_one_scope_stack_in_binding_order() -> Result<()> {
    let symbols = SymbolTable::with_tensor_ops();
    let first = FunctionRewriter::new();
    first.register("tensor.add", "default", mul_func);
    let second = FunctionRewriter::new();
    second.register("tensor.add", "default", origin_plus_one);

    let lhs = Tensor::vector(vec![2.0, 3.0]);
    let rhs = Tensor::vector(vec![4.0, 5.0]);
    let call = || {
        symbols.call::<BinaryTensorArgs, Tensor>("tensor.add", (lhs.clone(), rhs.clone()))
    };

    RewriterContext::new(RewriteConfig::default())
        .rewrite_functions(&first, &symbols)
        .rewrite_functions(&second, &symbols)
        .run(|| {
            assert_close(&call()?, &Tensor::vector(vec![9.0, 16.0]));
            Ok(())
        })?;

    RewriterContext::new(RewriteConfig::default())
        .rewrite_functions(&second, &symbols)
        .rewrite_functions(&first, &symbols)
        .run(|| {
            assert_close(&call()?, &Tensor::vector(vec![8.0, 15.0]));
            Ok(())
        })?;

    assert_close(&call()?, &Tensor::vector(vec![6.0, 8.0]));
    Ok(())
}
