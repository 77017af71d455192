use candle_core::{Result, Tensor};

/// Repeat KV heads for grouped-query attention.
///
/// `x` is `[batch, num_kv_heads, seq_len, head_dim]`; the result is
/// `[batch, num_kv_heads * num_kv_groups, seq_len, head_dim]` with each KV head
/// repeated for the query heads of its group.
pub fn repeat_kv(x: Tensor, num_kv_groups: usize) -> Result<Tensor> {
    if num_kv_groups == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, s, d) = x.dims4()?;
    x.unsqueeze(2)?
        .expand((b, num_kv_heads, num_kv_groups, s, d))?
        .reshape((b, num_kv_heads * num_kv_groups, s, d))
}

/// Split a fused QKV row block `[tokens, (h + 2 * kv) * d]` into
/// `[tokens, h, d]`, `[tokens, kv, d]`, `[tokens, kv, d]`.
pub fn split_qkv(
    qkv: &Tensor,
    num_heads: usize,
    num_kv_heads: usize,
    head_size: usize,
) -> Result<(Tensor, Tensor, Tensor)> {
    let tokens = qkv.dim(0)?;
    let q_width = num_heads * head_size;
    let kv_width = num_kv_heads * head_size;
    let q = qkv
        .narrow(1, 0, q_width)?
        .reshape((tokens, num_heads, head_size))?;
    let k = qkv
        .narrow(1, q_width, kv_width)?
        .reshape((tokens, num_kv_heads, head_size))?;
    let v = qkv
        .narrow(1, q_width + kv_width, kv_width)?
        .reshape((tokens, num_kv_heads, head_size))?;
    Ok((q, k, v))
}
