/// Derives the directory fan-out from the page size (spec §4.4): a page
/// stores `floor(page_size / sizeof(pointer))` pointers, which is how many
/// hash bits one directory layer can dispatch on.
pub fn bits_per_layer(page_size: usize) -> u32 {
    let pointers_per_page = page_size / std::mem::size_of::<usize>();
    (usize::BITS - pointers_per_page.leading_zeros() - 1).max(1)
}

/// Number of directory layers needed to dispatch on `num_bits` of hash,
/// `bits_per_layer` bits at a time (spec §4.4: `layers = ceil(numBits /
/// bitsPerLayer)`).
///
/// [`super::HashIndex`] keeps a single flat `Vec` of buckets rather than
/// building this layered directory physically — indexing a flat `Vec` by
/// the low `num_bits` bits of a hash is observably equivalent to walking a
/// fully-populated multi-layer directory down to its leaf, without the
/// pointer-chasing (see DESIGN.md). This function is kept because it's
/// still how an implementation decides *when* a doubling has grown the
/// table past what the current layer count could address.
pub fn num_layers(num_bits: u32, bits_per_layer: u32) -> u32 {
    if num_bits == 0 {
        return 0;
    }
    num_bits.div_ceil(bits_per_layer.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_per_layer_matches_4k_pages_with_8_byte_pointers() {
        // 4096 / 8 = 512 pointers/page; floor(log2(512)) = 9.
        assert_eq!(bits_per_layer(4096), 9);
    }

    #[test]
    fn num_layers_rounds_up() {
        assert_eq!(num_layers(9, 9), 1);
        assert_eq!(num_layers(10, 9), 2);
        assert_eq!(num_layers(0, 9), 0);
    }
}
