//! src/matrix.rs
//!
//! Row-major to column-major transposition of minibatch buffers.
//!
//! Decoded minibatches are produced item-major (`[B, D]`: one record per
//! item) but training kernels expect element-major (`[D, B]`: each feature
//! dimension contiguous across the batch). The transpose is agnostic to
//! element type and endianness: it moves opaque `elem_size`-byte units.

/// Transposes `rows x cols` elements of `elem_size` bytes from `src` into
/// `dst`: element `(i, j)` lands at offset `(j * rows + i) * elem_size`.
///
/// Panics if the slices do not both hold exactly `rows * cols` elements.
pub fn transpose(src: &[u8], dst: &mut [u8], rows: usize, cols: usize, elem_size: usize) {
    transpose_rows(src, dst, 0, rows, cols, elem_size);
}

/// Transposes a contiguous row range into the full destination.
///
/// `src` holds consecutive rows `row_start..row_start + n` of a logical
/// `total_rows x cols` matrix; each element of those rows is scattered to its
/// transposed position in `dst`, which covers the whole matrix. The plain
/// [`transpose`] is the `row_start = 0`, full-range case.
pub fn transpose_rows(
    src: &[u8],
    dst: &mut [u8],
    row_start: usize,
    total_rows: usize,
    cols: usize,
    elem_size: usize,
) {
    let row_len = cols * elem_size;
    assert!(row_len > 0, "transpose of zero-width rows");
    assert_eq!(src.len() % row_len, 0, "source is not whole rows");
    assert_eq!(dst.len(), total_rows * row_len, "destination size mismatch");

    let row_count = src.len() / row_len;
    assert!(row_start + row_count <= total_rows, "row range out of bounds");

    for r in 0..row_count {
        let row = &src[r * row_len..(r + 1) * row_len];
        let i = row_start + r;
        for j in 0..cols {
            let out = (j * total_rows + i) * elem_size;
            dst[out..out + elem_size].copy_from_slice(&row[j * elem_size..(j + 1) * elem_size]);
        }
    }
}
