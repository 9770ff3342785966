use std::cmp::Reverse;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt::{Debug, Formatter};

use bit_set::BitSet;
use instant::{Duration, Instant};
use log::{debug, trace};
use smallvec::SmallVec;

/// The expected maximum number of slots appearing in a grid.
pub const MAX_SLOT_COUNT: usize = 256;

/// The expected maximum length for a single slot.
pub const MAX_SLOT_LENGTH: usize = 21;

/// An identifier for a given slot, based on its index in the Puzzle's `slots` field.
pub type SlotId = usize;

/// An identifier for a given word, based on its index in the WordList's `words` field.
pub type WordId = usize;

/// Zero-indexed (row, col) coords for a cell in the grid, where row = 0 at the top.
type GridCoord = (usize, usize);

/// Direction that a slot is facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Across,
    Down,
}

/// A crossing between one slot and another, referencing the other slot's id and the
/// location of the shared cell within the other slot.
#[derive(Debug, Clone)]
struct Crossing {
    other_slot_id: SlotId,
    other_slot_cell: usize,
}

/// A fillable run of cells in one direction. Slots are owned by the `Puzzle` and
/// referenced everywhere else by `SlotId`.
#[derive(Debug, Clone)]
pub struct Slot {
    pub id: SlotId,
    pub row: usize,
    pub col: usize,
    pub direction: Direction,
    pub length: usize,

    /// For each cell of this slot, the crossing slot sharing that cell, if any.
    crossings: SmallVec<[Option<Crossing>; MAX_SLOT_LENGTH]>,

    /// The distinct slots crossing this one, in cell order.
    neighbors: SmallVec<[SlotId; 8]>,
}

impl Slot {
    /// Generate the coords for each cell of this slot.
    fn cell_coords(&self) -> impl Iterator<Item = GridCoord> + '_ {
        (0..self.length).map(move |cell_idx| match self.direction {
            Direction::Across => (self.row, self.col + cell_idx),
            Direction::Down => (self.row + cell_idx, self.col),
        })
    }
}

/// Two slots are the same slot iff they start in the same cell, face the same way,
/// and have the same length.
impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.row == other.row
            && self.col == other.col
            && self.direction == other.direction
            && self.length == other.length
    }
}

impl Eq for Slot {}

/// The static structure of a puzzle: its slots and the crossings between them.
/// Built once from grid geometry and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Puzzle {
    slots: SmallVec<[Slot; MAX_SLOT_COUNT]>,
}

impl Puzzle {
    /// Derive a puzzle from grid geometry, given as one `Vec<bool>` per row where
    /// `true` marks a fillable cell. Slots are the maximal horizontal and vertical
    /// runs of fillable cells with length >= 2; a lone cell is not a slot.
    pub fn from_cells(cells: &[Vec<bool>]) -> Puzzle {
        // (row, col, direction, length) for each run we find.
        let mut runs: Vec<(usize, usize, Direction, usize)> = vec![];

        for (row, line) in cells.iter().enumerate() {
            let mut run_start = 0;
            let mut run_len = 0;

            for (col, &open) in line.iter().enumerate() {
                if open {
                    if run_len == 0 {
                        run_start = col;
                    }
                    run_len += 1;
                } else {
                    if run_len >= 2 {
                        runs.push((row, run_start, Direction::Across, run_len));
                    }
                    run_len = 0;
                }
            }
            if run_len >= 2 {
                runs.push((row, run_start, Direction::Across, run_len));
            }
        }

        // Ragged input is tolerated by treating missing cells as blocked.
        let width = cells.iter().map(|row| row.len()).max().unwrap_or(0);

        for col in 0..width {
            let mut run_start = 0;
            let mut run_len = 0;

            for row in 0..cells.len() {
                let open = cells[row].get(col).copied().unwrap_or(false);
                if open {
                    if run_len == 0 {
                        run_start = row;
                    }
                    run_len += 1;
                } else {
                    if run_len >= 2 {
                        runs.push((run_start, col, Direction::Down, run_len));
                    }
                    run_len = 0;
                }
            }
            if run_len >= 2 {
                runs.push((run_start, col, Direction::Down, run_len));
            }
        }

        // Build a map from cell location to the runs occupying it, which we can then
        // use to calculate crossings. At most one across and one down run can share
        // a cell.
        let mut entries_by_cell: HashMap<GridCoord, SmallVec<[(SlotId, usize); 2]>> =
            HashMap::new();

        for (id, &(row, col, direction, length)) in runs.iter().enumerate() {
            for cell_idx in 0..length {
                let coord = match direction {
                    Direction::Across => (row, col + cell_idx),
                    Direction::Down => (row + cell_idx, col),
                };
                entries_by_cell.entry(coord).or_default().push((id, cell_idx));
            }
        }

        let slots = runs
            .iter()
            .enumerate()
            .map(|(id, &(row, col, direction, length))| {
                let mut slot = Slot {
                    id,
                    row,
                    col,
                    direction,
                    length,
                    crossings: SmallVec::new(),
                    neighbors: SmallVec::new(),
                };

                let coords: Vec<GridCoord> = slot.cell_coords().collect();
                for coord in coords {
                    let crossing = entries_by_cell[&coord]
                        .iter()
                        .find(|&&(other_id, _)| other_id != id)
                        .map(|&(other_slot_id, other_slot_cell)| Crossing {
                            other_slot_id,
                            other_slot_cell,
                        });

                    if let Some(crossing) = &crossing {
                        if !slot.neighbors.contains(&crossing.other_slot_id) {
                            slot.neighbors.push(crossing.other_slot_id);
                        }
                    }
                    slot.crossings.push(crossing);
                }

                slot
            })
            .collect();

        Puzzle { slots }
    }

    /// Derive a puzzle from a template string, with `#` representing blocked cells
    /// and anything else representing fillable cells.
    pub fn from_template(template: &str) -> Puzzle {
        let cells: Vec<Vec<bool>> = template
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() {
                    None
                } else {
                    Some(line.chars().map(|c| c != '#').collect())
                }
            })
            .collect();

        Puzzle::from_cells(&cells)
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot(&self, id: SlotId) -> &Slot {
        &self.slots[id]
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// The slots crossing the given slot, excluding the slot itself.
    pub fn neighbors(&self, id: SlotId) -> &[SlotId] {
        &self.slots[id].neighbors
    }

    /// The in-word offsets `(i, j)` such that cell `i` of slot `a` is cell `j` of
    /// slot `b`, or `None` if the slots don't intersect. Symmetric by construction:
    /// `overlap(a, b) == Some((i, j))` iff `overlap(b, a) == Some((j, i))`.
    pub fn overlap(&self, a: SlotId, b: SlotId) -> Option<(usize, usize)> {
        self.slots[a]
            .crossings
            .iter()
            .enumerate()
            .find_map(|(cell_idx, crossing)| match crossing {
                Some(crossing) if crossing.other_slot_id == b => {
                    Some((cell_idx, crossing.other_slot_cell))
                }
                _ => None,
            })
    }
}

/// A word that can be chosen for a slot, with its chars pre-split so that overlap
/// checks can index them directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    text: String,
    letters: SmallVec<[char; MAX_SLOT_LENGTH]>,
}

impl Word {
    fn new(text: String) -> Word {
        let letters = text.chars().collect();
        Word { text, letters }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.letters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.is_empty()
    }

    /// The letter at the given in-word offset, if the word is long enough.
    pub fn letter_at(&self, idx: usize) -> Option<char> {
        self.letters.get(idx).copied()
    }
}

/// The candidate vocabulary, deduplicated so that id equality doubles as word
/// equality everywhere downstream.
#[derive(Debug, Clone)]
pub struct WordList {
    words: Vec<Word>,
}

impl WordList {
    pub fn new<I, S>(words: I) -> WordList
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen: HashSet<String> = HashSet::new();
        let words = words
            .into_iter()
            .map(Into::into)
            .filter(|word| seen.insert(word.clone()))
            .map(Word::new)
            .collect();

        WordList { words }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn word(&self, id: WordId) -> &Word {
        &self.words[id]
    }

    pub fn iter(&self) -> impl Iterator<Item = (WordId, &Word)> {
        self.words.iter().enumerate()
    }
}

/// A log of domain removals made during propagation, so that a search branch can
/// undo exactly the changes it made before retreating.
type Trail = Vec<(SlotId, WordId)>;

/// The per-slot candidate sets. Initialized to the full vocabulary for every slot,
/// then only ever shrunk by node and arc consistency.
#[derive(Clone, PartialEq, Eq)]
pub struct Domains {
    by_slot: Vec<BitSet>,
}

impl Debug for Domains {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.by_slot.iter().enumerate().map(|(id, set)| (id, set.len())))
            .finish()
    }
}

impl Domains {
    /// Build the initial store, giving every slot the whole vocabulary.
    pub fn full(puzzle: &Puzzle, words: &WordList) -> Domains {
        Domains {
            by_slot: puzzle
                .slots()
                .iter()
                .map(|_| (0..words.len()).collect())
                .collect(),
        }
    }

    /// Remove every candidate failing the predicate from the given slot's domain.
    /// Returns whether anything was removed.
    pub fn restrict<F>(&mut self, slot: SlotId, words: &WordList, mut keep: F) -> bool
    where
        F: FnMut(&Word) -> bool,
    {
        let doomed: Vec<WordId> = self.by_slot[slot]
            .iter()
            .filter(|&id| !keep(words.word(id)))
            .collect();

        for &id in &doomed {
            self.by_slot[slot].remove(id);
        }
        !doomed.is_empty()
    }

    /// Make every slot node-consistent by removing candidates whose length doesn't
    /// match the slot's length. This is a one-pass filter, not iterative.
    pub fn enforce_node_consistency(&mut self, puzzle: &Puzzle, words: &WordList) {
        for slot in puzzle.slots() {
            self.restrict(slot.id, words, |word| word.len() == slot.length);
        }
    }

    pub fn candidates(&self, slot: SlotId) -> impl Iterator<Item = WordId> + '_ {
        self.by_slot[slot].iter()
    }

    pub fn contains(&self, slot: SlotId, word: WordId) -> bool {
        self.by_slot[slot].contains(word)
    }

    pub fn len(&self, slot: SlotId) -> usize {
        self.by_slot[slot].len()
    }

    pub fn is_empty(&self, slot: SlotId) -> bool {
        self.by_slot[slot].is_empty()
    }

    fn remove(&mut self, slot: SlotId, word: WordId) -> bool {
        self.by_slot[slot].remove(word)
    }

    fn insert(&mut self, slot: SlotId, word: WordId) {
        self.by_slot[slot].insert(word);
    }

    /// Capture the whole store so a caller can later roll back to it.
    pub fn snapshot(&self) -> Domains {
        self.clone()
    }

    pub fn restore(&mut self, snapshot: Domains) {
        *self = snapshot;
    }
}

/// Make `x` arc-consistent with `y`: remove every candidate of `x` that has no
/// supporting candidate in `y` agreeing on the overlap letter. A candidate only
/// counts as support if it's a different word, since two crossing slots can never
/// hold the same word once global uniqueness is enforced; filtering that out here
/// just prunes earlier. Returns whether anything was removed, recording removals
/// on the trail.
fn revise(
    puzzle: &Puzzle,
    words: &WordList,
    domains: &mut Domains,
    x: SlotId,
    y: SlotId,
    trail: &mut Trail,
) -> bool {
    let Some((i, j)) = puzzle.overlap(x, y) else {
        return false;
    };

    let doomed: Vec<WordId> = domains
        .candidates(x)
        .filter(|&wx_id| {
            let wx_letter = words.word(wx_id).letter_at(i);
            !domains.candidates(y).any(|wy_id| {
                wy_id != wx_id
                    && wx_letter.is_some()
                    && words.word(wy_id).letter_at(j) == wx_letter
            })
        })
        .collect();

    for &wx_id in &doomed {
        domains.remove(x, wx_id);
        trail.push((x, wx_id));
    }
    !doomed.is_empty()
}

/// All ordered pairs of neighboring slots, the default starting worklist for AC-3.
fn all_arcs(puzzle: &Puzzle) -> Vec<(SlotId, SlotId)> {
    puzzle
        .slots()
        .iter()
        .flat_map(|slot| puzzle.neighbors(slot.id).iter().map(|&y| (slot.id, y)))
        .collect()
}

/// Run AC-3 over the given initial arcs. Whenever revising an arc `(x, y)` shrinks
/// `x`'s domain, every arc `(z, x)` for the other neighbors `z` of `x` goes back on
/// the worklist, since consistency of `z` against `x` may no longer hold. The
/// worklist is LIFO; processing order only affects performance, not the resulting
/// domains. Returns `false` as soon as any domain is wiped out, which means the
/// puzzle as given has no solution.
fn ac3(
    puzzle: &Puzzle,
    words: &WordList,
    domains: &mut Domains,
    initial_arcs: Vec<(SlotId, SlotId)>,
    trail: &mut Trail,
    revisions: &mut u64,
) -> bool {
    let mut worklist = initial_arcs;

    while let Some((x, y)) = worklist.pop() {
        *revisions += 1;

        if revise(puzzle, words, domains, x, y, trail) {
            if domains.is_empty(x) {
                debug!("arc consistency wiped out the domain of slot {x}");
                return false;
            }
            for &z in puzzle.neighbors(x) {
                if z != y {
                    worklist.push((z, x));
                }
            }
        }
    }

    true
}

/// Make the whole domain store arc-consistent. Returns `false` if some slot's
/// domain is emptied, in which case the puzzle is unsatisfiable and the caller
/// must not proceed to search.
pub fn enforce_arc_consistency(
    puzzle: &Puzzle,
    words: &WordList,
    domains: &mut Domains,
) -> bool {
    let mut trail = Trail::new();
    let mut revisions = 0;
    ac3(puzzle, words, domains, all_arcs(puzzle), &mut trail, &mut revisions)
}

/// A partial mapping from slots to chosen words, grown by the search engine one
/// slot at a time and complete on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    by_slot: Vec<Option<WordId>>,
    assigned: usize,
}

impl Assignment {
    fn empty(slot_count: usize) -> Assignment {
        Assignment {
            by_slot: vec![None; slot_count],
            assigned: 0,
        }
    }

    pub fn get(&self, slot: SlotId) -> Option<WordId> {
        self.by_slot[slot]
    }

    /// Look up the chosen word's text for a slot.
    pub fn word<'a>(&self, slot: SlotId, words: &'a WordList) -> Option<&'a str> {
        self.by_slot[slot].map(|id| words.word(id).text())
    }

    pub fn is_complete(&self) -> bool {
        self.assigned == self.by_slot.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, WordId)> + '_ {
        self.by_slot
            .iter()
            .enumerate()
            .filter_map(|(slot, word)| word.map(|id| (slot, id)))
    }

    fn push(&mut self, slot: SlotId, word: WordId) {
        debug_assert!(self.by_slot[slot].is_none());
        self.by_slot[slot] = Some(word);
        self.assigned += 1;
    }

    fn pop(&mut self, slot: SlotId) {
        debug_assert!(self.by_slot[slot].is_some());
        self.by_slot[slot] = None;
        self.assigned -= 1;
    }
}

/// A struct tracking statistics about the filling process.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub states: u64,
    pub backtracks: u64,
    pub revisions: u64,
    pub duration: Duration,
}

/// A struct representing the results of a successful fill.
#[derive(Debug)]
pub struct FillSuccess {
    pub statistics: Statistics,
    pub assignment: Assignment,
}

/// Why a fill attempt came up empty. Both modes mean the same thing to a caller
/// ("no solution exists"), but they're distinguishable for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillFailure {
    /// Initial propagation emptied some slot's domain; search was never entered.
    Propagation,
    /// Backtracking explored every branch without finding a complete assignment.
    Exhausted,
}

/// The live state of a backtracking search over partial assignments.
struct Search<'a> {
    puzzle: &'a Puzzle,
    words: &'a WordList,
    domains: Domains,
    assignment: Assignment,
    statistics: Statistics,
}

impl Search<'_> {
    /// Pick the next slot to fill among the unassigned ones: minimum remaining
    /// values first, ties broken by maximum degree, remaining ties broken by lowest
    /// slot id so that runs are deterministic. Returns `None` once every slot is
    /// assigned.
    fn select_unassigned(&self) -> Option<SlotId> {
        (0..self.puzzle.slot_count())
            .filter(|&id| self.assignment.get(id).is_none())
            .min_by_key(|&id| {
                (
                    self.domains.len(id),
                    Reverse(self.puzzle.neighbors(id).len()),
                    id,
                )
            })
    }

    /// Order a slot's candidates by the least-constraining-value heuristic: for
    /// each candidate, count how many candidates it would rule out across the
    /// domains of unassigned neighbors, and try the least destructive ones first.
    fn order_domain_values(&self, slot: SlotId) -> Vec<WordId> {
        let mut scored: Vec<(usize, WordId)> = self
            .domains
            .candidates(slot)
            .map(|word_id| {
                let word = self.words.word(word_id);
                let mut eliminated = 0;

                for &neighbor in self.puzzle.neighbors(slot) {
                    if self.assignment.get(neighbor).is_some() {
                        continue;
                    }
                    let Some((i, j)) = self.puzzle.overlap(slot, neighbor) else {
                        continue;
                    };
                    for other_id in self.domains.candidates(neighbor) {
                        let agrees = match (
                            word.letter_at(i),
                            self.words.word(other_id).letter_at(j),
                        ) {
                            (Some(a), Some(b)) => a == b,
                            _ => false,
                        };
                        if !agrees {
                            eliminated += 1;
                        }
                    }
                }

                (eliminated, word_id)
            })
            .collect();

        scored.sort_unstable_by_key(|&(eliminated, word_id)| (eliminated, word_id));
        scored.into_iter().map(|(_, word_id)| word_id).collect()
    }

    /// Check the growing assignment as a whole: every word the right length, all
    /// chosen words pairwise distinct (uniqueness is global, not just between
    /// neighbors), and every assigned neighbor pair agreeing on its overlap letter.
    fn consistent(&self) -> bool {
        let mut used = BitSet::with_capacity(self.words.len());
        for (_, word_id) in self.assignment.iter() {
            if !used.insert(word_id) {
                return false;
            }
        }

        for (slot_id, word_id) in self.assignment.iter() {
            if self.words.word(word_id).len() != self.puzzle.slot(slot_id).length {
                return false;
            }

            for &neighbor in self.puzzle.neighbors(slot_id) {
                let Some(other_id) = self.assignment.get(neighbor) else {
                    continue;
                };
                let Some((i, j)) = self.puzzle.overlap(slot_id, neighbor) else {
                    continue;
                };
                if self.words.word(word_id).letter_at(i)
                    != self.words.word(other_id).letter_at(j)
                {
                    return false;
                }
            }
        }

        true
    }

    /// Maintain arc consistency under a tentative choice: narrow the slot's domain
    /// to the chosen word, then propagate outward from its neighbors. Every removal
    /// lands on the trail so the caller can roll the branch back exactly. Returns
    /// `false` if propagation wipes out some domain, meaning the choice can't lead
    /// to a solution.
    fn propagate_choice(&mut self, slot: SlotId, word: WordId, trail: &mut Trail) -> bool {
        debug_assert!(self.domains.contains(slot, word));

        let doomed: Vec<WordId> =
            self.domains.candidates(slot).filter(|&id| id != word).collect();
        for &id in &doomed {
            self.domains.remove(slot, id);
            trail.push((slot, id));
        }

        let arcs: Vec<(SlotId, SlotId)> = self
            .puzzle
            .neighbors(slot)
            .iter()
            .map(|&neighbor| (neighbor, slot))
            .collect();

        ac3(
            self.puzzle,
            self.words,
            &mut self.domains,
            arcs,
            trail,
            &mut self.statistics.revisions,
        )
    }

    /// Reinsert every domain removal recorded on a branch's trail.
    fn rollback(&mut self, trail: &Trail) {
        for &(slot, word) in trail.iter().rev() {
            self.domains.insert(slot, word);
        }
    }

    /// Depth-first backtracking with chronological retreat. Returns `true` once
    /// the assignment is complete and consistent; recursion depth equals the
    /// number of slots.
    fn backtrack(&mut self) -> bool {
        let Some(slot) = self.select_unassigned() else {
            return true;
        };
        self.statistics.states += 1;

        for word in self.order_domain_values(slot) {
            trace!(
                "trying {:?} in slot {slot} ({} candidates left)",
                self.words.word(word).text(),
                self.domains.len(slot),
            );

            self.assignment.push(slot, word);
            if self.consistent() {
                let mut trail = Trail::new();
                if self.propagate_choice(slot, word, &mut trail) && self.backtrack() {
                    return true;
                }
                self.rollback(&trail);
            }
            self.assignment.pop(slot);
            self.statistics.backtracks += 1;
        }

        false
    }
}

/// Fill the puzzle from the given vocabulary: node consistency, then AC-3, then
/// heuristic backtracking search. The result distinguishes the two failure modes
/// and carries statistics about the search.
pub fn find_fill(puzzle: &Puzzle, words: &WordList) -> Result<FillSuccess, FillFailure> {
    let start = Instant::now();
    let mut statistics = Statistics::default();

    let mut domains = Domains::full(puzzle, words);
    domains.enforce_node_consistency(puzzle, words);
    debug!(
        "node consistency left {} candidates across {} slots",
        (0..puzzle.slot_count()).map(|id| domains.len(id)).sum::<usize>(),
        puzzle.slot_count(),
    );

    let mut trail = Trail::new();
    if !ac3(
        puzzle,
        words,
        &mut domains,
        all_arcs(puzzle),
        &mut trail,
        &mut statistics.revisions,
    ) {
        debug!("initial propagation proved the puzzle unsatisfiable");
        return Err(FillFailure::Propagation);
    }

    let mut search = Search {
        puzzle,
        words,
        domains,
        assignment: Assignment::empty(puzzle.slot_count()),
        statistics,
    };
    let solved = search.backtrack();

    let mut statistics = search.statistics;
    statistics.duration = start.elapsed();

    if solved {
        debug!(
            "fill found after {} states, {} backtracks, {} revisions",
            statistics.states, statistics.backtracks, statistics.revisions,
        );
        Ok(FillSuccess {
            statistics,
            assignment: search.assignment,
        })
    } else {
        debug!(
            "search exhausted after {} states with no solution",
            statistics.states,
        );
        Err(FillFailure::Exhausted)
    }
}

/// Solve the puzzle, collapsing both failure modes into `None`: either a complete
/// assignment satisfying length, intersection, and uniqueness constraints exists
/// and is returned, or provably no solution exists.
pub fn solve(puzzle: &Puzzle, words: &WordList) -> Option<Assignment> {
    find_fill(puzzle, words).ok().map(|success| success.assignment)
}
