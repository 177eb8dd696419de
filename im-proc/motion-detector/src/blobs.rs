//! Noise suppression on the grid of changed samples.

/// A row-major grid of changed flags.
pub(crate) struct Mask {
    cols: usize,
    rows: usize,
    bits: Vec<bool>,
}

impl Mask {
    pub(crate) fn new(cols: usize, rows: usize, bits: Vec<bool>) -> Self {
        debug_assert_eq!(bits.len(), cols * rows);
        Self { cols, rows, bits }
    }

    #[cfg(test)]
    fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    /// In-bounds 3x3 neighbourhood of `(col, row)`, including itself.
    fn neighbours(&self, col: usize, row: usize) -> impl Iterator<Item = usize> + '_ {
        let c0 = col.saturating_sub(1);
        let c1 = (col + 1).min(self.cols - 1);
        let r0 = row.saturating_sub(1);
        let r1 = (row + 1).min(self.rows - 1);
        (r0..=r1).flat_map(move |r| (c0..=c1).map(move |c| r * self.cols + c))
    }

    fn morph(&self, all: bool) -> Self {
        let mut bits = Vec::with_capacity(self.bits.len());
        for row in 0..self.rows {
            for col in 0..self.cols {
                let mut n = self.neighbours(col, row);
                bits.push(if all {
                    n.all(|i| self.bits[i])
                } else {
                    n.any(|i| self.bits[i])
                });
            }
        }
        Self {
            cols: self.cols,
            rows: self.rows,
            bits,
        }
    }

    fn erode(&self) -> Self {
        self.morph(true)
    }

    fn dilate(&self) -> Self {
        self.morph(false)
    }

    /// Open then close: drops specks and thin lines, then fills pinholes.
    pub(crate) fn open_close(&self) -> Self {
        if self.bits.is_empty() {
            return Self::new(self.cols, self.rows, Vec::new());
        }
        self.erode().dilate().dilate().erode()
    }

    /// Sizes of the 8-connected groups of changed samples.
    pub(crate) fn blob_sizes(&self) -> Vec<usize> {
        let mut seen = vec![false; self.bits.len()];
        let mut sizes = Vec::new();
        let mut stack = Vec::new();
        for start in 0..self.bits.len() {
            if !self.bits[start] || seen[start] {
                continue;
            }
            seen[start] = true;
            stack.push(start);
            let mut size = 0;
            while let Some(i) = stack.pop() {
                size += 1;
                for j in self.neighbours(i % self.cols, i / self.cols) {
                    if self.bits[j] && !seen[j] {
                        seen[j] = true;
                        stack.push(j);
                    }
                }
            }
            sizes.push(size);
        }
        sizes
    }
}
